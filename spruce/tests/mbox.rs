use std::{fs, sync::Arc};

use concat_with::concat_line;
use spruce::{mbox::MboxStore, store::Store, Error, Flags, Folder, FolderKind};
use tempfile::tempdir;

const TWO_MESSAGES: &str = concat_line!(
    "From alice@localhost Mon Jan  2 15:04:05 2006",
    "Subject: first",
    "From: Alice <alice@localhost>",
    "",
    "body one",
    "",
    "From bob@localhost Tue Jan  3 10:00:00 2006",
    "Subject: second",
    "From: Bob <bob@localhost>",
    "",
    "body two",
    ""
);

async fn open_folder(store: &Arc<MboxStore>, name: &str) -> Arc<dyn Folder> {
    let folder = store.get_folder(name).await.unwrap();
    folder.open().await.unwrap();
    folder
}

#[test_log::test(tokio::test)]
async fn load_records_from_offsets() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("inbox"), TWO_MESSAGES).unwrap();

    let store = MboxStore::from_root(dir.path());
    let inbox = open_folder(&store, "inbox").await;

    let uids = inbox.get_uids().await.unwrap();
    assert_eq!(uids.len(), 2);

    let body = inbox.get_message(&uids[0]).await.unwrap();
    assert!(body.starts_with(b"Subject: first"));
    let body = inbox.get_message(&uids[1]).await.unwrap();
    assert!(body.starts_with(b"Subject: second"));

    let counts = inbox.counts();
    assert_eq!(counts.total, 2);
    assert_eq!(counts.unread, 2);

    inbox.close(false).await.unwrap();
    assert_eq!(inbox.counts().total, 2);
}

#[test_log::test(tokio::test)]
async fn expunge_rewrites_the_mailbox() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("inbox"), TWO_MESSAGES).unwrap();

    let store = MboxStore::from_root(dir.path());
    let inbox = open_folder(&store, "inbox").await;

    let uids = inbox.get_uids().await.unwrap();
    inbox
        .set_message_flags(&uids[0], Flags::DELETED, Flags::DELETED)
        .await
        .unwrap();
    inbox.expunge(None).await.unwrap();

    let remaining = inbox.get_uids().await.unwrap();
    assert_eq!(remaining, [uids[1].clone()]);

    // the survivor now starts at offset zero
    let data = fs::read(dir.path().join("inbox")).unwrap();
    assert!(data.starts_with(b"From bob@localhost"));

    let body = inbox.get_message(&uids[1]).await.unwrap();
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("Subject: second"));
    assert!(text.contains("body two"));
    assert!(!text.contains("body one"));

    // reopening scans the same single record back
    inbox.close(false).await.unwrap();
    inbox.open().await.unwrap();
    assert_eq!(inbox.get_uids().await.unwrap(), remaining);
}

#[test_log::test(tokio::test)]
async fn append_adds_from_line_and_flags_header() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path()).unwrap();
    let store = MboxStore::from_root(dir.path());

    let folder = store.get_folder("outbox").await.unwrap();
    folder
        .create(FolderKind::CAN_HOLD_MESSAGES)
        .await
        .unwrap();
    folder.open().await.unwrap();

    let msg = b"From: Carol <carol@localhost>\nSubject: fresh\n\nFrom here on this is body text\n";
    let uid = folder.append_message(msg, Flags::SEEN).await.unwrap();

    let data = fs::read_to_string(dir.path().join("outbox")).unwrap();
    assert!(data.starts_with("From carol@localhost "), "{data}");
    assert!(data.contains(&format!("X-Spruce: {uid}-0010")), "{data}");
    // interior From lines were escaped on the way in
    assert!(data.contains(">From here on"), "{data}");

    // and come back unescaped
    let fetched = folder.get_message(&uid).await.unwrap();
    let text = String::from_utf8(fetched).unwrap();
    assert!(text.contains("\nFrom here on this is body text"), "{text}");

    // appending again lands after exactly one blank separator line
    folder
        .append_message(b"Subject: next\n\nsecond body\n", Flags::empty())
        .await
        .unwrap();
    let data = fs::read_to_string(dir.path().join("outbox")).unwrap();
    assert!(data.contains("\n\nFrom postmaster@localhost"), "{data}");
    assert_eq!(folder.get_uids().await.unwrap().len(), 2);
}

#[test_log::test(tokio::test)]
async fn flags_sync_in_place_on_close() {
    let dir = tempdir().unwrap();
    let store = MboxStore::from_root(dir.path());

    let folder = store.get_folder("box").await.unwrap();
    folder.create(FolderKind::CAN_HOLD_MESSAGES).await.unwrap();
    folder.open().await.unwrap();

    let uid = folder
        .append_message(b"Subject: syncme\n\nbody\n", Flags::empty())
        .await
        .unwrap();
    folder
        .set_message_flags(&uid, Flags::SEEN, Flags::SEEN)
        .await
        .unwrap();
    folder.close(false).await.unwrap();

    // the X-Spruce header was patched without rewriting the file
    let data = fs::read_to_string(dir.path().join("box")).unwrap();
    assert!(data.contains(&format!("X-Spruce: {uid}-0010")), "{data}");

    // a fresh scan sees the synced flag
    fs::remove_file(dir.path().join(".box.summary")).unwrap();
    folder.open().await.unwrap();
    let uids = folder.get_uids().await.unwrap();
    assert_eq!(uids, [uid]);
    let found = folder
        .search(None, "(match-all (system-flag \"seen\"))")
        .await
        .unwrap();
    assert_eq!(found, uids);
}

#[test_log::test(tokio::test)]
async fn status_headers_are_tolerated() {
    let dir = tempdir().unwrap();
    let mbox = concat_line!(
        "From someone@example.com Mon Jan  2 15:04:05 2006",
        "Subject: external",
        "Status: RO",
        "X-Status: F",
        "",
        "delivered by another mailer",
        ""
    );
    fs::write(dir.path().join("inbox"), mbox).unwrap();

    let store = MboxStore::from_root(dir.path());
    let inbox = open_folder(&store, "inbox").await;

    let seen = inbox
        .search(None, "(match-all (system-flag \"seen\"))")
        .await
        .unwrap();
    let flagged = inbox
        .search(None, "(match-all (system-flag \"flagged\"))")
        .await
        .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen, flagged);
}

#[test_log::test(tokio::test)]
async fn invalid_mailbox_fails_to_open() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("broken"), "no from line here\n").unwrap();

    let store = MboxStore::from_root(dir.path());
    let folder = store.get_folder("broken").await.unwrap();
    assert!(folder.open().await.is_err());
}

#[test_log::test(tokio::test)]
async fn reserved_and_hidden_names_are_rejected() {
    let dir = tempdir().unwrap();
    let store = MboxStore::from_root(dir.path());

    for name in ["a.sbd", "b.summary", "c.msf", "d~", ".hidden"] {
        assert!(
            matches!(store.get_folder(name).await, Err(Error::IllegalName(_))),
            "{name} should be rejected"
        );
    }
}

#[test_log::test(tokio::test)]
async fn subfolders_live_in_sbd_directories() {
    let dir = tempdir().unwrap();
    let store = MboxStore::from_root(dir.path());

    let parent = store.get_folder("work").await.unwrap();
    parent.create(FolderKind::CAN_HOLD_ANYTHING).await.unwrap();
    let child = store.get_folder("work/reports").await.unwrap();
    child.create(FolderKind::CAN_HOLD_MESSAGES).await.unwrap();

    assert!(dir.path().join("work").is_file());
    assert!(dir.path().join("work.sbd").is_dir());
    assert!(dir.path().join("work.sbd/reports").is_file());

    let top = store.get_folder("").await.unwrap();
    let listed = top.list("*").await.unwrap();
    let names: Vec<String> = listed.iter().map(|folder| folder.name()).collect();
    assert_eq!(names, ["work"]);

    let children = parent.list("*").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].full_name(), "work/reports");

    // deleting the parent takes the .sbd tree first, then the mailbox
    child.close(false).await.unwrap();
    parent.delete().await.unwrap();
    assert!(!dir.path().join("work.sbd").exists());
    assert!(!dir.path().join("work").exists());
}
