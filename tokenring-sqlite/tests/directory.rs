use std::env::temp_dir;

use tokenring_directory::{test_suite, Directory, VirtualNode};
use tokenring_sqlite::SqliteDirectory;

#[tokio::test]
async fn test_disk_directory_conformance() {
    let _ = tracing_subscriber::fmt::try_init();

    let path = temp_dir().join(uuid::Uuid::new_v4().to_string());
    let directory = SqliteDirectory::open(&path).await.expect("open directory");

    test_suite::run_directory_suite(directory).await;
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let path = temp_dir().join(uuid::Uuid::new_v4().to_string());
    let seed = vec![
        VirtualNode::new(1, "127.0.0.1", 9101, 9201),
        VirtualNode::new(2, "127.0.0.1", 9102, 9202),
    ];

    {
        let directory = SqliteDirectory::open(&path).await.unwrap();
        directory.initialize(&seed).await.unwrap();
        directory.set_node_successor(1, 2).await.unwrap();
        directory.set_node_successor(2, 1).await.unwrap();
        directory.update_coordinator(2).await.unwrap();
    }

    let directory = SqliteDirectory::open(&path).await.unwrap();
    directory.initialize(&seed).await.unwrap();

    assert_eq!(directory.ring_size().await.unwrap(), 2);
    let nodes = directory.get_all_nodes().await.unwrap();
    let coordinator = nodes
        .iter()
        .find(|node| node.is_coordinator)
        .expect("coordinator flag persisted");
    assert_eq!(coordinator.node_id, 2);
}

#[tokio::test]
async fn test_full_restart_drops_previous_state() {
    let path = temp_dir().join(uuid::Uuid::new_v4().to_string());
    let seed = vec![VirtualNode::new(1, "127.0.0.1", 9101, 9201)];

    {
        let directory = SqliteDirectory::open(&path).await.unwrap();
        directory.initialize(&seed).await.unwrap();
        directory.set_node_successor(1, 1).await.unwrap();
    }

    let directory = SqliteDirectory::open_full_restart(&path).await.unwrap();
    directory.initialize(&seed).await.unwrap();

    assert_eq!(directory.ring_size().await.unwrap(), 0);
    assert_eq!(directory.get_all_nodes().await.unwrap().len(), 1);
}
