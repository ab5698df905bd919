use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use lightscribe_core::inference::stub::stub_handle;
use lightscribe_core::{
    LoadError, ModelHandle, ModelLoader, TranscribeOptions, Transcriber, TranscriberConfig,
};

/// Stub models that count their loads and take a while to appear.
#[derive(Default)]
struct CountingLoader {
    loads: AtomicUsize,
    delay: Duration,
}

impl CountingLoader {
    fn slow(delay: Duration) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            delay,
        }
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn load(&self, model_id: &str) -> Result<ModelHandle, LoadError> {
        if model_id.starts_with("missing") {
            return Err(LoadError::ModelNotFound {
                model_id: model_id.to_string(),
            });
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        Ok(stub_handle())
    }
}

fn options() -> TranscribeOptions {
    TranscribeOptions {
        language: Some("en".into()),
        ..Default::default()
    }
}

fn transcriber(loader: &Arc<CountingLoader>, capacity: usize) -> Transcriber {
    let config = TranscriberConfig {
        cache_capacity: capacity,
        ..Default::default()
    };
    Transcriber::new(config, Arc::clone(loader) as Arc<dyn ModelLoader>)
}

#[test]
fn alternating_models_reload_at_capacity_one() {
    let loader = Arc::new(CountingLoader::default());
    let t = transcriber(&loader, 1);
    let audio = vec![0.0f32; 16_000];

    for id in ["a", "b", "a"] {
        t.transcribe(audio.clone(), id, &options()).unwrap();
    }
    assert_eq!(loader.loads(), 3);
    assert_eq!(t.cache_stats().keys(), vec!["a"]);
}

#[test]
fn larger_capacity_keeps_both_models() {
    let loader = Arc::new(CountingLoader::default());
    let t = transcriber(&loader, 2);
    let audio = vec![0.0f32; 16_000];

    for id in ["a", "b", "a", "b"] {
        t.transcribe(audio.clone(), id, &options()).unwrap();
    }
    assert_eq!(loader.loads(), 2);
    assert_eq!(t.cache_stats().keys(), vec!["a", "b"]);
}

#[test]
fn concurrent_requests_share_one_load() {
    let loader = Arc::new(CountingLoader::slow(Duration::from_millis(100)));
    let t = transcriber(&loader, 1);
    let barrier = Arc::new(Barrier::new(6));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let t = t.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                t.transcribe(vec![0.0f32; 32_000], "shared", &options())
            })
        })
        .collect();
    for w in workers {
        let result = w.join().unwrap().unwrap();
        assert_eq!(result.segments.len(), 1);
    }
    assert_eq!(loader.loads(), 1);
    assert_eq!(t.cache_stats().occupancy, 1);
}

#[test]
fn failed_load_is_not_cached() {
    let loader = Arc::new(CountingLoader::default());
    let t = transcriber(&loader, 2);
    let audio = vec![0.0f32; 16_000];

    assert!(t.transcribe(audio.clone(), "missing", &options()).is_err());
    assert!(t.transcribe(audio, "missing", &options()).is_err());
    assert_eq!(t.cache_stats().occupancy, 0);
}

#[test]
fn shrinking_capacity_evicts_least_recent() {
    let loader = Arc::new(CountingLoader::default());
    let t = transcriber(&loader, 3);
    let audio = vec![0.0f32; 16_000];
    for id in ["a", "b", "c", "a"] {
        t.transcribe(audio.clone(), id, &options()).unwrap();
    }
    t.set_cache_capacity(1).unwrap();
    assert_eq!(t.cache_stats().keys(), vec!["a"]);
    assert_eq!(t.unload_model("b"), 0);
}

#[test]
fn unloading_a_model_drops_all_of_its_variants() {
    let loader = Arc::new(CountingLoader::default());
    let t = transcriber(&loader, 3);
    let audio = vec![0.0f32; 16_000];
    for id in ["small", "small@q8", "tiny"] {
        t.transcribe(audio.clone(), id, &options()).unwrap();
    }

    assert_eq!(t.unload_model("small"), 2);
    assert_eq!(t.cache_stats().keys(), vec!["tiny"]);

    t.transcribe(audio, "small@q8", &options()).unwrap();
    assert_eq!(loader.loads(), 4);
}
