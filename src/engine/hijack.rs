//! Raw connection takeover for requests hyper cannot represent.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::net::{ConnectionInfo, Transport};

/// A connection taken away from the HTTP/1 engine.
pub struct Hijacked {
    pub io: Box<dyn Transport>,
    /// Bytes already read past the end of the request head.
    pub read_buf: Bytes,
    pub info: ConnectionInfo,
}

type OnHijack = Box<dyn FnOnce() + Send>;

struct Inner {
    parts: Mutex<Option<Hijacked>>,
    on_hijack: Mutex<Option<OnHijack>>,
}

/// Request extension granting ownership of the underlying connection.
///
/// Taking the connection removes it from the engine's bookkeeping: the
/// engine reports [`crate::net::ConnState::Hijacked`] and will neither
/// answer the request nor close the connection afterwards.
#[derive(Clone)]
pub struct Hijack {
    inner: Arc<Inner>,
}

impl Hijack {
    pub(crate) fn new(parts: Hijacked, on_hijack: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                parts: Mutex::new(Some(parts)),
                on_hijack: Mutex::new(Some(Box::new(on_hijack))),
            }),
        }
    }

    /// Take the connection. Returns `None` if it was already taken.
    pub fn take(&self) -> Option<Hijacked> {
        let parts = self
            .inner
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let hook = self
            .inner
            .on_hijack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
        Some(parts)
    }

    /// Take the connection back for the engine without reporting a hijack.
    pub(crate) fn reclaim(&self) -> Option<Hijacked> {
        self.inner
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for Hijack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hijack").finish_non_exhaustive()
    }
}
