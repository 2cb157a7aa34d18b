//! Snapshot reconciliation: merge a pulled remote key→value map into the
//! local store without a server adjudicating conflicts.
//!
//! Per-key writes are independent; a cycle that fails partway leaves the
//! keys already merged in place. Sync is best-effort, not a transaction.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::keys;
use crate::session::ChatItem;
use crate::store::KvStore;

/// Apply a remote snapshot to the local store. Returns the number of keys
/// whose local value changed.
///
/// Rules, per remote key:
/// - absent locally: the remote value is written as-is;
/// - session config: a differing `session_name` means a renamed or newer
///   session, so the remote config overwrites wholesale; an equal name
///   keeps local unchanged (no per-field merge);
/// - chat history: the ordered merge below, written back only when it
///   changes the local array;
/// - anything else: local wins once a local value exists.
pub async fn apply_snapshot(
    kv: &KvStore,
    snapshot: &BTreeMap<String, Value>,
) -> crate::Result<usize> {
    let mut applied = 0;
    for (key, remote) in snapshot {
        let Some(local) = kv.get(key).await? else {
            kv.set(key, remote.clone()).await?;
            applied += 1;
            continue;
        };
        if keys::parse_session_config(key).is_some() {
            if local.get("session_name") != remote.get("session_name") {
                kv.set(key, remote.clone()).await?;
                applied += 1;
            }
        } else if keys::parse_chat_history(key).is_some() {
            let local_items: Vec<ChatItem> = serde_json::from_value(local)?;
            let remote_items: Vec<ChatItem> = serde_json::from_value(remote.clone())?;
            let merged = merge_history(&local_items, &remote_items);
            if merged != local_items {
                kv.set(key, serde_json::to_value(&merged)?).await?;
                applied += 1;
            }
        }
    }
    Ok(applied)
}

/// Interleave two chat histories by the creation time embedded in each
/// chat id, producing one array with non-decreasing timestamps modulo
/// legacy entries.
///
/// Legacy ids cannot be ordered: local ones stay where they are, remote
/// ones are spliced in just before the current local position. Equal
/// timestamps mean the same logical chat exists on both sides, so the
/// whole id run (the human/AI pair) is skipped without duplicating.
pub fn merge_history(local: &[ChatItem], remote: &[ChatItem]) -> Vec<ChatItem> {
    let mut merged: Vec<ChatItem> = local.to_vec();
    let mut i_local = 0;
    let mut i_remote = 0;

    'local_scan: while i_local < merged.len() {
        let Some(local_num) = merged[i_local].chat_id.created_at() else {
            i_local += 1;
            continue;
        };

        let remote_num = loop {
            let Some(item) = remote.get(i_remote) else {
                break 'local_scan;
            };
            match item.chat_id.created_at() {
                Some(num) => break num,
                None => {
                    merged.insert(i_local, item.clone());
                    i_local += 1;
                    i_remote += 1;
                }
            }
        };

        if local_num == remote_num {
            let local_id = merged[i_local].chat_id.clone();
            while i_local < merged.len() && merged[i_local].chat_id == local_id {
                i_local += 1;
            }
            let remote_id = remote[i_remote].chat_id.clone();
            while i_remote < remote.len() && remote[i_remote].chat_id == remote_id {
                i_remote += 1;
            }
        } else if local_num > remote_num {
            // The remote entry is older and missing locally.
            merged.insert(i_local, remote[i_remote].clone());
            i_local += 1;
            i_remote += 1;
        } else {
            // Remote catches up once local reaches its timestamp.
            i_local += 1;
        }
    }

    merged.extend(remote[i_remote..].iter().cloned());
    merged
}
