use parking_lot::Mutex;

/// An ordered batch of formatted StatsD lines.
///
/// Lines can be appended concurrently from any number of threads. The lock is only held for the duration of a single
/// append or swap, never across a network call.
#[derive(Debug, Default)]
pub struct CommandBatch {
    lines: Mutex<Vec<String>>,
}

impl CommandBatch {
    /// Creates a new, empty `CommandBatch`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line to the end of the batch.
    pub fn add(&self, line: String) {
        self.lines.lock().push(line);
    }

    /// Takes the current batch, leaving an empty one in its place.
    ///
    /// Any line appended concurrently either lands in the returned batch or in the fresh one, never both.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }

    /// Puts previously taken lines back at the front of the batch.
    ///
    /// Lines appended since the matching [`take`](CommandBatch::take) stay behind the restored ones, so the overall
    /// insertion order is preserved.
    pub fn restore(&self, mut taken: Vec<String>) {
        if taken.is_empty() {
            return;
        }

        let mut lines = self.lines.lock();
        taken.append(&mut lines);
        *lines = taken;
    }

    /// Returns a copy of the lines currently in the batch.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Returns the number of lines in the batch.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Returns `true` if the batch holds no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use proptest::prelude::*;

    use super::CommandBatch;

    #[test]
    fn take_resets() {
        let batch = CommandBatch::new();
        batch.add("a:1|c\n".to_string());
        batch.add("b:2|c\n".to_string());

        assert_eq!(batch.take(), vec!["a:1|c\n", "b:2|c\n"]);
        assert!(batch.is_empty());
        assert!(batch.take().is_empty());
    }

    #[test]
    fn restore_goes_in_front() {
        let batch = CommandBatch::new();
        batch.add("a:1|c\n".to_string());
        let taken = batch.take();

        batch.add("b:2|c\n".to_string());
        batch.restore(taken);

        assert_eq!(batch.snapshot(), vec!["a:1|c\n", "b:2|c\n"]);
        assert_eq!(batch.len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn concurrent_adds_are_never_lost(threads in 1usize..8, per_thread in 1usize..200) {
            let batch = Arc::new(CommandBatch::new());

            let taker = {
                let batch = Arc::clone(&batch);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    for _ in 0..16 {
                        taken.extend(batch.take());
                        thread::yield_now();
                    }
                    taken
                })
            };

            let writers = (0..threads)
                .map(|t| {
                    let batch = Arc::clone(&batch);
                    thread::spawn(move || {
                        for i in 0..per_thread {
                            batch.add(format!("t{t}:{i}|c\n"));
                        }
                    })
                })
                .collect::<Vec<_>>();

            for writer in writers {
                writer.join().unwrap();
            }

            let mut all = taker.join().unwrap();
            all.extend(batch.take());

            prop_assert_eq!(all.len(), threads * per_thread);
            let unique = all.iter().collect::<HashSet<_>>();
            prop_assert_eq!(unique.len(), all.len());

            // Within each thread, lines must come out in the order they were appended.
            for t in 0..threads {
                let prefix = format!("t{t}:");
                let seen = all
                    .iter()
                    .filter_map(|line| line.strip_prefix(&prefix))
                    .map(|rest| rest.trim_end_matches("|c\n").parse::<usize>().unwrap())
                    .collect::<Vec<_>>();
                prop_assert_eq!(seen, (0..per_thread).collect::<Vec<_>>());
            }
        }
    }
}
