//! Protocol engines.
//!
//! # Data Flow
//! ```text
//! StreamListener ─accept─▶ H1Engine ─┬─ ALPN h2 ──────────▶ H2Engine::serve_connection
//!                                    ├─ "PRI * HTTP/2.0" ─▶ Hijack ─▶ handler (h2c)
//!                                    └─ otherwise ────────▶ hyper http1
//!
//! UDP socket ─▶ quic.rs EarlyListener ─▶ H3Engine ─▶ h3 request streams
//!
//! every request ─▶ dispatch(): attach ConnectionInfo, box the body ─▶ Handler
//! ```
//!
//! # Design Decisions
//! - Each engine exposes serve / shutdown / close; runners compose them
//! - "Engine closed" is reported as [`crate::Error::Closed`]
//! - Forced close drops connection futures; handler calls spawned by an
//!   engine can outlive that, which the abort gate covers

pub mod h1;
pub mod h2;
pub mod h3;
pub mod hijack;
mod idle;
pub mod quic;

use std::sync::Arc;

use http::Request;
use hyper::body::Incoming;

use crate::http::{body, Handler, HandlerFuture};
use crate::net::ConnectionInfo;

pub use h1::{H1Engine, H1Services};
pub use h2::{H2Engine, ServeConnOpts};
pub use h3::H3Engine;
pub use hijack::{Hijack, Hijacked};
pub use quic::EarlyListener;

/// Hand a hyper request to the handler with the connection context attached.
pub(crate) fn dispatch(
    handler: &Arc<dyn Handler>,
    info: &ConnectionInfo,
    req: Request<Incoming>,
) -> HandlerFuture {
    let (mut parts, incoming) = req.into_parts();
    parts.extensions.insert(info.clone());
    handler.call(Request::from_parts(parts, body::boxed(incoming)))
}
