//! Background delivery of absence notices.
//!
//! A dedicated OS thread owns the delivery backend and drains a bounded
//! queue. Callers enqueue without waiting and never see the outcome.
//! Notices still queued when the process exits are lost.

use rollcall_core::{AbsenceNotice, AbsenteeSink, Notifier, NotifyError};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 16;

/// Clone-safe enqueue handle for the notification worker.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<AbsenceNotice>,
}

impl AbsenteeSink for NotifierHandle {
    fn dispatch(&self, notice: AbsenceNotice) {
        match self.tx.try_send(notice) {
            Ok(()) => tracing::debug!("absence notice queued"),
            Err(TrySendError::Full(notice)) => tracing::warn!(
                date = %notice.date,
                subject = %notice.subject,
                "notification queue full; notice dropped"
            ),
            Err(TrySendError::Closed(_)) => tracing::warn!("notification worker gone; notice dropped"),
        }
    }
}

/// Completion signal of the worker thread, fired once its queue is closed and drained.
pub struct NotifierWorker {
    done: oneshot::Receiver<()>,
}

impl NotifierWorker {
    /// Wait up to `grace` for queued notices to be delivered.
    ///
    /// Every [`NotifierHandle`] must be dropped first, or this simply times out.
    pub async fn drain(self, grace: Duration) {
        match tokio::time::timeout(grace, self.done).await {
            Ok(_) => tracing::debug!("notification worker drained"),
            Err(_) => tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "notification worker still busy at exit; pending notices dropped"
            ),
        }
    }
}

/// Spawn the delivery thread for `backend`.
pub fn spawn_notifier(mut backend: Box<dyn Notifier>) -> std::io::Result<(NotifierHandle, NotifierWorker)> {
    let (tx, mut rx) = mpsc::channel::<AbsenceNotice>(QUEUE_DEPTH);
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("rollcall-notify".into())
        .spawn(move || {
            tracing::debug!("notification worker started");
            while let Some(notice) = rx.blocking_recv() {
                match backend.notify(&notice) {
                    Ok(()) => tracing::info!(
                        date = %notice.date,
                        subject = %notice.subject,
                        absentees = notice.absentees.len(),
                        "absence notice delivered"
                    ),
                    Err(err) => tracing::warn!(
                        error = %err,
                        date = %notice.date,
                        subject = %notice.subject,
                        "absence notice delivery failed"
                    ),
                }
            }
            let _ = done_tx.send(());
        })?;

    Ok((NotifierHandle { tx }, NotifierWorker { done: done_rx }))
}

/// Writes one log line per absentee. Nothing leaves the process.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, notice: &AbsenceNotice) -> Result<(), NotifyError> {
        for absentee in &notice.absentees {
            tracing::info!(
                name = %absentee.name,
                address = %absentee.address,
                date = %notice.date,
                subject = %notice.subject,
                "absent"
            );
        }
        Ok(())
    }
}

/// Appends each notice as one JSON line to a file picked up by an external mailer.
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&mut self, notice: &AbsenceNotice) -> Result<(), NotifyError> {
        let line = serde_json::to_string(notice)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rollcall_core::Absentee;
    use std::sync::{Arc, Mutex};

    struct Collecting(Arc<Mutex<Vec<AbsenceNotice>>>);

    impl Notifier for Collecting {
        fn notify(&mut self, notice: &AbsenceNotice) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    struct Failing;

    impl Notifier for Failing {
        fn notify(&mut self, _notice: &AbsenceNotice) -> Result<(), NotifyError> {
            Err(NotifyError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "smtp unreachable")))
        }
    }

    fn notice(subject: &str) -> AbsenceNotice {
        AbsenceNotice {
            date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            subject: subject.into(),
            absentees: vec![Absentee {
                name: "Asha".into(),
                address: "asha@example.edu".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_worker_delivers_then_drains() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handle, worker) = spawn_notifier(Box::new(Collecting(seen.clone()))).unwrap();

        handle.dispatch(notice("Maths"));
        handle.dispatch(notice("Physics"));
        drop(handle);
        worker.drain(Duration::from_secs(5)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].subject, "Physics");
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let (handle, worker) = spawn_notifier(Box::new(Failing)).unwrap();
        handle.dispatch(notice("Maths"));
        drop(handle);
        worker.drain(Duration::from_secs(5)).await;
    }

    #[test]
    fn test_outbox_appends_json_lines() {
        let path = std::env::temp_dir().join(format!("rollcall-outbox-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut outbox = OutboxNotifier::new(&path);
        outbox.notify(&notice("Maths")).unwrap();
        outbox.notify(&notice("Physics")).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AbsenceNotice> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], notice("Maths"));
        let _ = std::fs::remove_file(&path);
    }
}
