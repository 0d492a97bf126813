//! Application callback capability record
//!
//! A context holds one optional callback per event class. `None` means "use
//! the default": buffered delivery for data and OOB, implicit accept for
//! authentication, nothing for the rest. Callbacks run on the context's loop
//! thread and must not call back into the context.

use crate::block::{DataBlock, OobBlock};
use rist_protocol::{PeerId, ReceiverStats, SenderStats};
use std::net::SocketAddr;

/// Details handed to the connect callback for an authentication decision
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub peer: PeerId,
    /// Remote cname from the keep-alive exchange
    pub cname: String,
}

/// Stats snapshot for the stats callback
#[derive(Debug, Clone)]
pub enum StatsSnapshot {
    Sender(SenderStats),
    Receiver(ReceiverStats),
}

pub type ConnectCallback = Box<dyn Fn(&ConnectRequest) -> bool + Send>;
pub type DisconnectCallback = Box<dyn Fn(PeerId) + Send>;
pub type DataCallback = Box<dyn Fn(DataBlock) + Send>;
pub type OobCallback = Box<dyn Fn(OobBlock) + Send>;
pub type StatsCallback = Box<dyn Fn(&StatsSnapshot) + Send>;

/// The capability record
#[derive(Default)]
pub struct Handlers {
    pub connect: Option<ConnectCallback>,
    pub disconnect: Option<DisconnectCallback>,
    pub data: Option<DataCallback>,
    pub oob: Option<OobCallback>,
    pub stats: Option<StatsCallback>,
}

impl Handlers {
    /// Authentication verdict: installed handler decides, absence accepts
    pub fn authorize(&self, request: &ConnectRequest) -> bool {
        match &self.connect {
            Some(cb) => cb(request),
            None => true,
        }
    }

    pub fn on_disconnect(&self, peer: PeerId) {
        if let Some(cb) = &self.disconnect {
            cb(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn request() -> ConnectRequest {
        ConnectRequest {
            remote: "203.0.113.1:1968".parse().unwrap(),
            local: "0.0.0.0:1968".parse().unwrap(),
            peer: PeerId(1),
            cname: "remote".into(),
        }
    }

    #[test]
    fn test_implicit_accept_without_handler() {
        let handlers = Handlers::default();
        assert!(handlers.authorize(&request()));
    }

    #[test]
    fn test_handler_verdict_respected() {
        let mut handlers = Handlers::default();
        handlers.connect = Some(Box::new(|req| req.cname == "trusted"));
        assert!(!handlers.authorize(&request()));

        let mut req = request();
        req.cname = "trusted".into();
        assert!(handlers.authorize(&req));
    }

    #[test]
    fn test_disconnect_invoked() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let mut handlers = Handlers::default();
        handlers.disconnect = Some(Box::new(move |_| flag.store(true, Ordering::SeqCst)));
        handlers.on_disconnect(PeerId(3));
        assert!(fired.load(Ordering::SeqCst));
    }
}
