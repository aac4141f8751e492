use altfinder_db::{DbError, Store};
use tracing::{debug, info};

/// Copy every sighting from one store to another, page by page.
///
/// With `truncate` the destination is emptied before the first page is
/// written. Returns the number of rows copied.
pub async fn copy_store(
    from: &dyn Store,
    to: &dyn Store,
    page_size: usize,
    truncate: bool,
) -> Result<u64, DbError> {
    let page_size = page_size.max(1);
    let mut cursor = 0;
    let mut copied = 0u64;
    let mut first = true;

    loop {
        let page = from.dump(cursor, page_size).await?;
        let rows = page.rows.len() as u64;

        // An empty source still truncates the destination
        if !page.rows.is_empty() || first {
            to.load(page.rows, truncate && first).await?;
        }
        first = false;
        copied += rows;
        debug!(copied, "copied page");

        match page.next {
            Some(next) => cursor = next,
            None => break,
        }
    }

    info!(copied, "store copy finished");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use altfinder_db::{SqliteStore, StoreOptions};
    use uuid::Uuid;

    async fn store() -> SqliteStore {
        SqliteStore::open_in_memory(StoreOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_copy_preserves_rows() {
        let from = store().await;
        let to = store().await;
        let players: Vec<Uuid> = (0..7).map(|_| Uuid::new_v4()).collect();
        for (n, player) in players.iter().enumerate() {
            for _ in 0..=n {
                from.upsert(*player, &format!("10.0.0.{n}"), "lobby")
                    .await
                    .unwrap();
            }
        }
        to.upsert(Uuid::new_v4(), "192.168.1.1", "stale").await.unwrap();

        let copied = copy_store(&from, &to, 3, true).await.unwrap();
        assert_eq!(copied, 7);

        let loaded = to.load_all().await.unwrap();
        assert_eq!(loaded.sightings.len(), 7);
        for (n, player) in players.iter().enumerate() {
            let rows = to.get_by_player(*player).await.unwrap();
            assert_eq!(rows.iter().next().unwrap().count, n as i64 + 1);
        }
        assert!(to.get_by_ip("192.168.1.1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_without_truncate_merges() {
        let from = store().await;
        let to = store().await;
        from.upsert(Uuid::new_v4(), "10.0.0.1", "lobby").await.unwrap();
        to.upsert(Uuid::new_v4(), "10.0.0.2", "lobby").await.unwrap();

        assert_eq!(copy_store(&from, &to, 100, false).await.unwrap(), 1);
        assert_eq!(to.load_all().await.unwrap().sightings.len(), 2);
    }

    #[tokio::test]
    async fn test_copy_empty_source_truncates() {
        let from = store().await;
        let to = store().await;
        to.upsert(Uuid::new_v4(), "10.0.0.2", "lobby").await.unwrap();

        assert_eq!(copy_store(&from, &to, 10, true).await.unwrap(), 0);
        assert!(to.load_all().await.unwrap().sightings.is_empty());
    }
}
