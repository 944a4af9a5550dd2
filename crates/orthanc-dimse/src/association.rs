use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dicom_ul::association::client::{ClientAssociation, ClientAssociationOptions};

use crate::error::DimseError;

/// Identifies which outbound association is currently open, so a request
/// for a different remote forces a close-and-reopen (spec.md §4.H
/// "identified by (local-AET, remote-parameters)").
#[derive(Debug, Clone, PartialEq, Eq)]
struct AssociationKey {
    local_aet: String,
    remote_aet: String,
    remote_host: String,
    remote_port: u16,
}

struct ActiveAssociation {
    key: AssociationKey,
    assoc: ClientAssociation<TcpStream>,
    last_used: Instant,
}

struct Inner {
    current: Mutex<Option<ActiveAssociation>>,
    close_delay: Mutex<Duration>,
    shutdown: Mutex<bool>,
}

/// At most one open outbound association, reused across calls with the same
/// remote and torn down by an idle-reaper thread after `close_delay` of
/// inactivity (spec.md §4.H). Outbound traffic uses `dicom-ul`'s synchronous
/// `ClientAssociationOptions`, the only mode compatible with the explicit
/// thread/condvar concurrency model this workspace otherwise uses.
pub struct ReusableAssociation {
    inner: Arc<Inner>,
    reaper: Mutex<Option<thread::JoinHandle<()>>>,
}

/// RAII lease on the shared association. Updates `last_used` on drop so the
/// reaper's idle clock restarts from the moment the lease is released.
pub struct AssociationLease<'a> {
    inner: &'a Arc<Inner>,
}

impl ReusableAssociation {
    pub fn new(close_delay: Duration) -> Arc<Self> {
        let inner = Arc::new(Inner {
            current: Mutex::new(None),
            close_delay: Mutex::new(close_delay),
            shutdown: Mutex::new(false),
        });

        let this = Arc::new(ReusableAssociation { inner, reaper: Mutex::new(None) });
        this.spawn_reaper();
        this
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("orthanc-dimse-association-reaper".to_string())
            .spawn(move || loop {
                let delay = *inner.close_delay.lock().unwrap();
                thread::sleep(delay.min(Duration::from_secs(1)).max(Duration::from_millis(100)));
                if *inner.shutdown.lock().unwrap() {
                    return;
                }
                let mut current = inner.current.lock().unwrap();
                if let Some(active) = current.as_ref() {
                    if active.last_used.elapsed() >= delay {
                        *current = None;
                    }
                }
            })
            .expect("failed to spawn association reaper thread");
        *self.reaper.lock().unwrap() = Some(handle);
    }

    /// Set the idle timeout at runtime; takes effect on the reaper's next
    /// check (spec.md §5 "the timeout is configurable at runtime and takes
    /// effect on the next check").
    pub fn set_close_delay(&self, delay: Duration) {
        *self.inner.close_delay.lock().unwrap() = delay;
    }

    /// Reuse the open association if it matches, otherwise close any
    /// existing one and open a fresh association to `remote_host:remote_port`.
    pub fn acquire(
        &self,
        local_aet: &str,
        remote_aet: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<AssociationLease<'_>, DimseError> {
        let key = AssociationKey {
            local_aet: local_aet.to_string(),
            remote_aet: remote_aet.to_string(),
            remote_host: remote_host.to_string(),
            remote_port,
        };

        let mut current = self.inner.current.lock().unwrap();
        let needs_new = match current.as_ref() {
            Some(active) => active.key != key,
            None => true,
        };
        if needs_new {
            *current = None;
            let stream = TcpStream::connect((remote_host, remote_port))
                .map_err(|e| DimseError::Network(e.to_string()))?;
            let assoc = ClientAssociationOptions::new()
                .calling_ae_title(local_aet)
                .called_ae_title(remote_aet)
                .establish(stream)?;
            *current = Some(ActiveAssociation { key, assoc, last_used: Instant::now() });
        }
        drop(current);
        Ok(AssociationLease { inner: &self.inner })
    }

    /// Stop the idle reaper and join it (spec.md §9 "the association-close
    /// thread is process-wide and must be joined on shutdown").
    pub fn shutdown(&self) {
        *self.inner.shutdown.lock().unwrap() = true;
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl AssociationLease<'_> {
    /// Run `f` against the live association under the association mutex,
    /// serializing all outbound DICOM operations (spec.md §5 "Association
    /// mutex (H) serializes all outbound DICOM operations").
    pub fn with_association<R>(&self, f: impl FnOnce(&mut ClientAssociation<TcpStream>) -> R) -> Option<R> {
        let mut current = self.inner.current.lock().unwrap();
        current.as_mut().map(|active| f(&mut active.assoc))
    }
}

impl Drop for AssociationLease<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.inner.current.lock().unwrap().as_mut() {
            active.last_used = Instant::now();
        }
    }
}
