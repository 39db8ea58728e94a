use std::sync::Arc;
use std::time::Duration;

use picassiette::{Bitmap, Picassiette};
use picassiette_test::CallCounter;

use crate::{channel_target, next_delivery, test};

/// Produces a solid square bitmap for keys like `"red/4"`.
fn squares(
    counter: &Arc<CallCounter>,
) -> impl Fn(&str, &()) -> anyhow::Result<Option<Bitmap>> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |key: &str, _: &()| {
        counter.record(key);
        let Some((color, size)) = key.split_once('/') else {
            return Ok(None);
        };
        let size: u32 = size.parse()?;
        let pixel: [u8; 4] = match color {
            "red" => [0xff, 0, 0, 0xff],
            "green" => [0, 0xff, 0, 0xff],
            _ => [0, 0, 0xff, 0xff],
        };
        let pixels = pixel.repeat((size * size) as usize);
        Ok(Bitmap::new(size, size, pixels))
    }
}

fn build(
    cache_dir: &test::TempDir,
    counter: &Arc<CallCounter>,
    disk_capacity: u64,
) -> Picassiette<Bitmap> {
    Picassiette::builder(squares(counter))
        .cache_dir(cache_dir.path())
        .disk_capacity(disk_capacity)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_bitmaps_survive_restart() {
    test::setup();
    let cache_dir = test::tempdir();
    let counter = Arc::new(CallCounter::new());
    let keys = ["red/2", "green/3", "blue/4"];

    {
        let picassiette = build(&cache_dir, &counter, 1024 * 1024);
        let cache = picassiette.cache().unwrap();
        cache.ready().await;
        let (target, mut deliveries) = channel_target();

        for key in keys {
            picassiette.fetch(key, (), &target);
            assert!(next_delivery(&mut deliveries).await.is_some());
        }
        // bitmaps are weighed by their decoded size
        assert_eq!(cache.memory().size(), (4 + 9 + 16) * 4);

        cache.evict_all();
        cache.flush().await;
    }

    let picassiette = build(&cache_dir, &counter, 1024 * 1024);
    picassiette.cache().unwrap().ready().await;
    let (target, mut deliveries) = channel_target();

    picassiette.fetch("green/3", (), &target);
    let bitmap = next_delivery(&mut deliveries).await.unwrap();
    assert_eq!((bitmap.width(), bitmap.height()), (3, 3));
    assert_eq!(&bitmap.pixels()[..4], &[0u8, 0xff, 0, 0xff]);

    for key in keys {
        assert_eq!(counter.get(key), 1, "{key}");
    }
}

#[tokio::test]
async fn test_store_trimmed_on_restart() {
    test::setup();
    let cache_dir = test::tempdir();
    let counter = Arc::new(CallCounter::new());
    // header plus 2x2 RGBA pixels
    let entry_size = 12 + 16;

    {
        let picassiette = build(&cache_dir, &counter, 1024 * 1024);
        let cache = picassiette.cache().unwrap();
        cache.ready().await;
        let (target, mut deliveries) = channel_target();

        for key in ["red/2", "green/2", "blue/2"] {
            picassiette.fetch(key, (), &target);
            next_delivery(&mut deliveries).await;
            cache.evict_all();
            cache.flush().await;
            // distinct modification times
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cache.disk().unwrap().len(), 3);
    }

    let picassiette = build(&cache_dir, &counter, 2 * entry_size);
    let cache = picassiette.cache().unwrap();
    cache.ready().await;
    assert_eq!(cache.disk().unwrap().len(), 2);
    assert_eq!(cache.disk().unwrap().size(), 2 * entry_size);

    let (target, mut deliveries) = channel_target();
    for key in ["red/2", "green/2", "blue/2"] {
        picassiette.fetch(key, (), &target);
        assert!(next_delivery(&mut deliveries).await.is_some());
    }
    // only the oldest entry had to be produced again
    assert_eq!(counter.get("red/2"), 2);
    assert_eq!(counter.get("green/2"), 1);
    assert_eq!(counter.get("blue/2"), 1);
}

#[tokio::test]
async fn test_invalid_key_delivers_none() {
    test::setup();
    let cache_dir = test::tempdir();
    let counter = Arc::new(CallCounter::new());
    let picassiette = build(&cache_dir, &counter, 1024);
    let (target, mut deliveries) = channel_target();

    picassiette.fetch("red/lots", (), &target);
    assert_eq!(next_delivery(&mut deliveries).await, None);
    picassiette.fetch("no-size", (), &target);
    assert_eq!(next_delivery(&mut deliveries).await, None);
    assert!(picassiette.cache().unwrap().memory().is_empty());
}
