use std::fs;
use std::sync::Arc;

use picassiette::Picassiette;
use picassiette::config::Config;

use crate::{channel_target, next_delivery, test};

fn echo(key: &str, _: &()) -> anyhow::Result<Option<String>> {
    Ok(Some(key.to_uppercase()))
}

#[tokio::test]
async fn test_evicted_entry_moves_to_disk() {
    test::setup();
    let cache_dir = test::tempdir();
    let picassiette = Picassiette::builder(echo)
        .cache_dir(cache_dir.path())
        .memory_capacity(2)
        .build()
        .unwrap();
    let cache = picassiette.cache().unwrap();
    cache.ready().await;
    let (target, mut deliveries) = channel_target();

    for key in ["a", "b", "c"] {
        picassiette.fetch(key, (), &target);
        assert_eq!(next_delivery(&mut deliveries).await, Some(key.to_uppercase()));
    }
    cache.flush().await;

    assert_eq!(cache.lookup_memory("a"), None);
    assert_eq!(cache.lookup_memory("b"), Some("B".into()));
    assert_eq!(cache.lookup_memory("c"), Some("C".into()));
    assert_eq!(cache.lookup_disk("a").await, Some("A".into()));
}

#[tokio::test]
async fn test_build_from_config_file() {
    test::setup();
    let cache_dir = test::tempdir();
    let config_path = cache_dir.path().join("config.yml");
    fs::write(
        &config_path,
        format!(
            "cache_dir: {}\ncache:\n  memory_capacity: 1\n  disk_namespace: thumbs\n",
            cache_dir.path().display()
        ),
    )
    .unwrap();

    let config = Config::get(Some(&config_path)).unwrap();
    let picassiette = Picassiette::builder(echo).config(&config).build().unwrap();
    let cache = picassiette.cache().unwrap();
    cache.ready().await;
    let (target, mut deliveries) = channel_target();

    picassiette.fetch("a", (), &target);
    next_delivery(&mut deliveries).await;
    picassiette.fetch("b", (), &target);
    next_delivery(&mut deliveries).await;
    cache.flush().await;

    let store = cache.disk().unwrap();
    assert_eq!(store.dir(), cache_dir.path().join("thumbs"));
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_targets() {
    test::setup();
    let picassiette = Picassiette::builder(echo)
        .max_concurrent_fetches(3)
        .build()
        .unwrap();

    let mut targets = vec![];
    for i in 0..20 {
        let key = format!("key-{}", i % 5);
        let (target, deliveries) = channel_target();
        picassiette.fetch(&key, (), &target);
        targets.push((key, target, deliveries));
    }

    for (key, _target, mut deliveries) in targets {
        assert_eq!(next_delivery(&mut deliveries).await, Some(key.to_uppercase()));
    }
}

#[tokio::test]
async fn test_clones_share_state() {
    test::setup();
    let picassiette = Picassiette::builder(echo).build().unwrap();
    let clone = picassiette.clone();
    let (target, mut deliveries) = channel_target();

    picassiette.fetch("a", (), &target);
    next_delivery(&mut deliveries).await;
    drop(picassiette);

    let cache = clone.cache().unwrap();
    assert_eq!(cache.lookup_memory("a"), Some("A".into()));
    clone.fetch("a", (), &target);
    assert_eq!(next_delivery(&mut deliveries).await, Some("A".into()));
    assert_eq!(Arc::strong_count(&target), 1);
}
