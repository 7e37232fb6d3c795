//! Ready-made diagnostics delegate that logs to a pair of streams.

use crate::diagnostics::{levels, DiagnosticsDelegate};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

/// Build a delegate that formats messages onto two writers.
///
/// Messages at [`levels::WARNING`] and above go to `error`, the rest to
/// `output`. Each line looks like:
///
/// ```text
/// [<seconds> <sender>:<level>] <decoration><message>
/// ```
///
/// where `<seconds>` counts from when the reporter was created and
/// `<decoration>` is `"error: "` at [`levels::ERROR`] and above,
/// `"warning: "` at [`levels::WARNING`] and above, and empty otherwise.
///
/// Write failures are swallowed; a dead log stream must not take the
/// publisher down with it.
pub fn stream_reporter<O, E>(output: O, error: E) -> DiagnosticsDelegate
where
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    let output = Mutex::new(output);
    let error = Mutex::new(error);
    let start = Instant::now();
    Arc::new(move |sender_name: &str, level: usize, message: &str| {
        let elapsed = start.elapsed().as_secs_f64();
        let decoration = if level >= levels::ERROR {
            "error: "
        } else if level >= levels::WARNING {
            "warning: "
        } else {
            ""
        };
        let line = format!("[{elapsed:.6} {sender_name}:{level}] {decoration}{message}\n");
        if level >= levels::WARNING {
            let _ = error.lock().write_all(line.as_bytes());
        } else {
            let _ = output.lock().write_all(line.as_bytes());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticsBus;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc as StdArc;

    /// Shared Vec<u8> sink the test can inspect after the delegate runs.
    #[derive(Clone, Default)]
    struct SharedSink(StdArc<PlMutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn lines(sink: &SharedSink) -> Vec<String> {
        String::from_utf8(sink.0.lock().clone())
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Strip the "[<timestamp> " prefix the way a log reader would.
    fn after_timestamp(line: &str) -> &str {
        assert!(line.starts_with('['));
        let space = line.find(' ').unwrap();
        &line[space + 1..]
    }

    #[test]
    fn routes_and_decorates_by_level() {
        let out = SharedSink::default();
        let err = SharedSink::default();
        let bus = DiagnosticsBus::new("foo");
        let unsubscribe = bus.subscribe(stream_reporter(out.clone(), err.clone()), 0);

        bus.publish(0, "hello");
        bus.publish(10, "world");
        bus.publish(2, "last message");
        bus.publish(5, "be careful");
        unsubscribe.unsubscribe();
        bus.publish(0, "really the last message");

        let out_lines = lines(&out);
        assert_eq!(out_lines.len(), 2);
        assert_eq!(after_timestamp(&out_lines[0]), "foo:0] hello");
        assert_eq!(after_timestamp(&out_lines[1]), "foo:2] last message");

        let err_lines = lines(&err);
        assert_eq!(err_lines.len(), 2);
        assert_eq!(after_timestamp(&err_lines[0]), "foo:10] error: world");
        assert_eq!(after_timestamp(&err_lines[1]), "foo:5] warning: be careful");
    }
}
