//! Shared helpers for kf_store integration tests.
//!
//! Tests use the password unlock path throughout: the keychain path needs a
//! live OS credential store, which CI runners do not have.

#![allow(dead_code)]

use tempfile::TempDir;

use kf_store::Keyfold;

pub const PASSWORD: &str = "correct horse battery staple";

pub async fn open_service() -> (TempDir, Keyfold) {
    let dir = TempDir::new().expect("tempdir");
    let service = Keyfold::open(&dir.path().join("keyfold.db"))
        .await
        .expect("open store");
    (dir, service)
}

pub async fn open_initialised() -> (TempDir, Keyfold) {
    let (dir, service) = open_service().await;
    service
        .init_identity(Some(PASSWORD))
        .await
        .expect("init identity");
    (dir, service)
}
