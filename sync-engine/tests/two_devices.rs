//! Two engines replicating through an in-process connection.

mod common;

use common::{connect, pair, touch, Device, FOLDER};

fn conflict_copies(device: &Device, base: &str) -> Vec<String> {
    device
        .listing()
        .into_iter()
        .filter(|n| n.starts_with(&format!("{base}.sync-conflict-")))
        .collect()
}

#[tokio::test]
async fn new_file_replicates() {
    let (a, b) = pair();
    connect(&a, &b).await;

    a.write("docs/readme.md", b"# hello\n");
    a.model.scan(FOLDER, &[]).await.unwrap();
    let summary = b.model.pull(FOLDER).await.unwrap();

    assert_eq!(summary.failed, 0);
    assert_eq!(b.read("docs/readme.md"), b"# hello\n");
    assert!(b.path("docs").is_dir());
}

#[tokio::test]
async fn deletion_replicates() {
    let (a, b) = pair();
    a.write("gone", b"short lived");
    a.model.scan(FOLDER, &[]).await.unwrap();
    connect(&a, &b).await;
    b.model.pull(FOLDER).await.unwrap();
    assert!(b.path("gone").exists());

    std::fs::remove_file(a.path("gone")).unwrap();
    a.model.scan(FOLDER, &[]).await.unwrap();
    b.model.pull(FOLDER).await.unwrap();

    assert!(!b.path("gone").exists());
    let record = b
        .model
        .folder(FOLDER)
        .unwrap()
        .index()
        .local("gone")
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_deleted());
}

#[tokio::test]
async fn rename_against_concurrent_edit_keeps_both() {
    let (x, y) = pair();
    x.write("a", b"original");
    x.model.scan(FOLDER, &[]).await.unwrap();
    connect(&x, &y).await;
    y.model.pull(FOLDER).await.unwrap();
    assert_eq!(y.read("a"), b"original");

    // x renames a to b; y creates its own b meanwhile.
    std::fs::rename(x.path("a"), x.path("b")).unwrap();
    touch(&x.path("b"), 3600);
    x.model.scan(FOLDER, &[]).await.unwrap();
    y.write("b", b"local edit");
    y.model.scan(FOLDER, &[]).await.unwrap();

    let summary = y.model.pull(FOLDER).await.unwrap();
    assert_eq!(summary.failed, 0);

    assert_eq!(y.read("b"), b"original");
    assert!(!y.path("a").exists());
    let copies = conflict_copies(&y, "b");
    assert_eq!(copies.len(), 1);
    assert_eq!(y.read(&copies[0]), b"local edit");

    // The conflict copy is an ordinary file and replicates back.
    x.model.pull(FOLDER).await.unwrap();
    assert_eq!(x.read("b"), b"original");
    let copies = conflict_copies(&x, "b");
    assert_eq!(copies.len(), 1);
    assert_eq!(x.read(&copies[0]), b"local edit");
    assert_eq!(x.listing(), y.listing());
}
