//! Oldest-first rolling retention.

use std::future::Future;

use tracing::debug;

use crate::error::Result;

/// Deletes the entries beyond the newest `depth` of a chronologically
/// ordered collection (oldest first), invoking `delete` once per victim.
///
/// The arithmetic is exactly `excess = len - depth`: a non-positive excess
/// is a no-op, so `depth >= len` keeps everything and `depth == 0` deletes
/// exactly `len` entries rather than being special-cased.
///
/// The same law serves per-disk chains, the per-VM metadata history, plain
/// full-image backups, hypervisor snapshots and DR copies; only `delete`
/// changes.
pub async fn prune<T, D, Fut>(mut entries: Vec<T>, depth: usize, delete: D) -> Result<usize>
where
    D: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let excess = entries.len() as i64 - depth as i64;
    if excess <= 0 {
        return Ok(0);
    }
    let excess = excess as usize;

    for entry in entries.drain(..excess) {
        delete(entry).await?;
    }

    debug!(deleted = excess, kept = depth, "pruned retention set");
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn deletes_exactly_the_oldest_excess() {
        for (depth, expected) in [(0usize, 4usize), (1, 3), (4, 0), (9, 0)] {
            let deleted = Mutex::new(Vec::new());
            let entries = vec!["t1", "t2", "t3", "t4"];

            let count = prune(entries, depth, |entry| {
                let deleted = &deleted;
                async move {
                    deleted.lock().unwrap().push(entry);
                    Ok(())
                }
            })
            .await
            .unwrap();

            let deleted = deleted.into_inner().unwrap();
            assert_eq!(count, expected, "depth {depth}");
            assert_eq!(deleted.len(), expected, "depth {depth}");
            // Victims are the oldest entries, in order.
            assert_eq!(deleted, ["t1", "t2", "t3", "t4"][..expected].to_vec());
        }
    }

    #[tokio::test]
    async fn depth_greater_than_length_is_a_noop() {
        let count = prune(vec![1, 2], 7, |_| async { panic!("nothing to delete") })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn delete_failure_propagates() {
        let attempted = Mutex::new(0usize);
        let result = prune(vec!["a", "b", "c"], 1, |_| async {
            *attempted.lock().unwrap() += 1;
            Err(crate::BackupError::NotFound("gone".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*attempted.lock().unwrap(), 1);
    }
}
