use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use featcache::{
    build_features, BoxError, BuildOptions, CacheConfig, CacheStore, DynamicFeature, Feature,
    Params, RowFilter, StaticFeature, Table, Value,
};
use tempfile::tempdir;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn city_table(ids: &[&str]) -> Result<Table, BoxError> {
    Ok(Table::new(
        ["city_code", "total_pop"],
        ids.iter()
            .map(|id| vec![Value::from(*id), Value::Int(50_000)])
            .collect(),
    )?)
}

#[test]
fn cache_miss_then_hit_emit_events() {
    let temp = tempdir().expect("temp dir should be created");

    let logs = capture_logs(Level::DEBUG, || {
        let store = CacheStore::new(&CacheConfig {
            root: temp.path().to_path_buf(),
        });
        let feature = StaticFeature::builder("population", |_: &Params| city_table(&["TLV"]))
            .build(&store)
            .expect("descriptor should build");
        feature.run().expect("first run computes");
        feature.run().expect("second run is cached");
    });

    assert!(logs.contains("\"event\":\"cache.config\""));
    assert!(logs.contains("\"event\":\"features.cache.miss\""));
    assert!(logs.contains("\"event\":\"features.cache.write\""));
    assert!(logs.contains("\"event\":\"features.static.computed\""));
    assert!(logs.contains("\"event\":\"features.cache.hit\""));
    assert!(logs.contains("\"event\":\"features.static.cached\""));
}

#[test]
fn history_resolution_reports_source() {
    let temp = tempdir().expect("temp dir should be created");

    let logs = capture_logs(Level::INFO, || {
        let store = CacheStore::new(&CacheConfig {
            root: temp.path().to_path_buf(),
        });
        let feature = DynamicFeature::builder("rainfall", |date: NaiveDate, _: &Params| {
            Ok(Table::new(
                ["city_code", "day_date", "mm"],
                vec![vec![Value::from("TLV"), Value::Date(date), Value::Float(1.0)]],
            )?)
        })
        .offset(3)
        .build(&store)
        .expect("descriptor should build");
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).expect("valid date");
        feature.run(date).expect("first run computes");
        feature.run(date).expect("second run is cached");
    });

    assert!(logs.contains("\"event\":\"features.history.resolve\""));
    assert!(logs.contains("\"source\":\"computed\""));
    assert!(logs.contains("\"source\":\"cached\""));
    assert!(logs.contains("\"offset\":3"));
}

#[test]
fn build_logs_start_finish_and_empty_join_warning() {
    let temp = tempdir().expect("temp dir should be created");

    let logs = capture_logs(Level::INFO, || {
        let store = CacheStore::new(&CacheConfig {
            root: temp.path().to_path_buf(),
        });
        let left: Feature = StaticFeature::builder("north", |_: &Params| city_table(&["TLV"]))
            .build(&store)
            .expect("descriptor should build")
            .into();
        let right: Feature = StaticFeature::builder("south", |_: &Params| city_table(&["EIL"]))
            .build(&store)
            .expect("descriptor should build")
            .into();
        let options = BuildOptions {
            filter: RowFilter::KeepAll,
            ..BuildOptions::default()
        };
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).expect("valid date");

        let built = build_features(&[left, right], date, &options).expect("build succeeds");
        assert!(built.is_empty());
    });

    assert!(logs.contains("\"event\":\"features.build.start\""));
    assert!(logs.contains("\"event\":\"features.build.empty_join\""));
    assert!(logs.contains("\"event\":\"features.build.finish\""));
}
