//! Reader groups
//!
//! A [`ReaderGroup`] owns an ordered, fixed list of readers and answers one
//! domain question per [`collect`](ReaderGroup::collect) call.

use std::fmt;

use crate::logging::Logger;
use crate::reader::{read_isolated, SensorReader};
use crate::snapshot::{Snapshot, SnapshotBuilder};

/// Named bundle of sensor readers
pub struct ReaderGroup {
    name: String,
    readers: Vec<Box<dyn SensorReader>>,
    logger: Logger,
}

impl ReaderGroup {
    /// Create an empty group
    pub fn new(name: impl Into<String>, logger: Logger) -> Self {
        Self {
            name: name.into(),
            readers: Vec::new(),
            logger,
        }
    }

    /// Builder-style [`push`](Self::push)
    pub fn with_reader(mut self, reader: impl SensorReader + 'static) -> Self {
        self.push(Box::new(reader));
        self
    }

    /// Append a reader; it runs after every reader added before it
    pub fn push(&mut self, reader: Box<dyn SensorReader>) {
        let existing = self.metric_names();
        for name in reader.metric_names() {
            if existing.contains(&name) {
                self.logger.warn(&format!(
                    "Metric {} of {} is already produced in group {}; the later reader wins",
                    name,
                    reader.label(),
                    self.name
                ));
            }
        }
        self.readers.push(reader);
    }

    /// Group identity
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logging handle of this group
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Number of readers
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// Whether the group has no readers
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Every metric name the group emits, in reader order
    pub fn metric_names(&self) -> Vec<String> {
        self.readers.iter().flat_map(|r| r.metric_names()).collect()
    }

    /// Run every reader in order and merge the results
    ///
    /// Never fails: a reader that errors contributes absent metrics.
    pub fn collect(&mut self) -> Snapshot {
        let mut builder = SnapshotBuilder::new(self.name.clone());
        for reader in self.readers.iter_mut() {
            for metric in read_isolated(reader.as_mut(), &self.logger) {
                builder.insert(metric);
            }
        }
        builder.build()
    }

    /// Release every reader's resources
    pub fn release(&mut self) {
        for reader in self.readers.iter_mut() {
            reader.release();
        }
    }
}

impl fmt::Debug for ReaderGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderGroup")
            .field("name", &self.name)
            .field("readers", &self.readers.iter().map(|r| r.label()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use crate::metric::Metric;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        value: Option<f64>,
        calls: Arc<AtomicUsize>,
        order: CallOrder,
    }

    impl SensorReader for Fixed {
        fn label(&self) -> &str {
            self.name
        }

        fn metric_names(&self) -> Vec<String> {
            vec![self.name.to_string()]
        }

        fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name);
            match self.value {
                Some(v) => Ok(vec![Metric::new(self.name, v)]),
                None => Err(SensorError::unavailable(self.name, "offline")),
            }
        }
    }

    type CallOrder = Arc<std::sync::Mutex<Vec<&'static str>>>;

    fn group_of(values: &[(&'static str, Option<f64>)]) -> (ReaderGroup, Arc<AtomicUsize>, CallOrder) {
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut group = ReaderGroup::new("test", Logger::disabled("test"));
        for &(name, value) in values {
            group.push(Box::new(Fixed {
                name,
                value,
                calls: calls.clone(),
                order: order.clone(),
            }));
        }
        (group, calls, order)
    }

    #[test]
    fn test_collect_all_success() {
        let (mut group, _, _) = group_of(&[("a", Some(1.0)), ("b", Some(2.0))]);
        let snapshot = group.collect();
        assert_eq!(snapshot.group(), "test");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.present_count(), 2);
    }

    #[test]
    fn test_failure_does_not_stop_later_readers() {
        let (mut group, calls, order) =
            group_of(&[("a", None), ("b", Some(2.0)), ("c", None), ("d", Some(4.0))]);
        let snapshot = group.collect();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(snapshot.len(), 4);
        assert!(!snapshot.get("a").unwrap().present());
        assert_eq!(snapshot.get("d").unwrap().as_f64(), Some(4.0));
    }

    #[test]
    fn test_all_failing_still_returns_snapshot() {
        let (mut group, _, _) = group_of(&[("a", None), ("b", None)]);
        let snapshot = group.collect();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.present_count(), 0);
    }

    #[test]
    fn test_duplicate_name_last_write_wins() {
        let (mut group, _, _) = group_of(&[("a", Some(1.0)), ("a", Some(9.0))]);
        let snapshot = group.collect();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a").unwrap().as_f64(), Some(9.0));
    }

    #[test]
    fn test_empty_group() {
        let mut group = ReaderGroup::new("empty", Logger::disabled("empty"));
        assert!(group.is_empty());
        assert!(group.collect().is_empty());
    }
}
