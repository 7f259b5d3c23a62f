//! Outbound client contexts.
//!
//! Forwarding a request to a zone ECU occupies one context from a pool
//! sized at startup. A context carries the request bytes and the caller's
//! completion callback while the gateway walks the dial, activation and
//! response steps on the associated link; the slot frees when the callback
//! fires. A full pool refuses new requests instead of queuing them.

use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;
use zgw_doip::LinkError;
use zgw_uds::{ResponseError, ServiceResponse};

/// Why an outbound request failed before a usable response arrived.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("all {capacity} client contexts are in use")]
    PoolExhausted { capacity: usize },

    #[error("no zone endpoint configured for address {0:#06X}")]
    UnknownTarget(u16),

    #[error("routing activation refused with code {code:#04X}")]
    ActivationRefused { code: u8 },

    #[error("link closed before a response arrived")]
    Disconnected,

    #[error(transparent)]
    BadResponse(#[from] ResponseError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Completion callback for one outbound request.
pub type ClientCallback = Box<dyn FnOnce(Result<ServiceResponse, ClientError>) + Send>;

/// Handle to an occupied pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(usize);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One in-flight outbound request.
pub struct ClientContext {
    pub target_address: u16,
    /// Raw UDS request bytes; the first byte is the service id the
    /// response will be decoded against.
    pub request: Vec<u8>,
    callback: ClientCallback,
}

impl ClientContext {
    pub fn new(target_address: u16, request: Vec<u8>, callback: ClientCallback) -> Self {
        Self {
            target_address,
            request,
            callback,
        }
    }

    /// Consume the context and deliver the outcome to its caller.
    pub fn complete(self, result: Result<ServiceResponse, ClientError>) {
        (self.callback)(result);
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("target_address", &format_args!("{:#06X}", self.target_address))
            .field("request_len", &self.request.len())
            .finish()
    }
}

/// Fixed-size slot arena for outbound requests.
pub struct ClientPool {
    slots: Mutex<Vec<Option<ClientContext>>>,
}

impl ClientPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Park `context` in a free slot. Hands the context back when every
    /// slot is busy.
    pub fn acquire(&self, context: ClientContext) -> Result<ContextId, ClientContext> {
        let mut slots = self.slots.lock();
        match slots.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
            Some((index, slot)) => {
                *slot = Some(context);
                Ok(ContextId(index))
            }
            None => Err(context),
        }
    }

    /// Remove and return the context, freeing its slot.
    pub fn take(&self, id: ContextId) -> Option<ClientContext> {
        self.slots.lock().get_mut(id.0)?.take()
    }

    /// Target address and request bytes of an occupied slot, cloned so the
    /// context stays parked until its response arrives.
    pub fn pending_request(&self, id: ContextId) -> Option<(u16, Vec<u8>)> {
        self.slots
            .lock()
            .get(id.0)?
            .as_ref()
            .map(|c| (c.target_address, c.request.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    fn context(target: u16) -> ClientContext {
        ClientContext::new(target, vec![0x22, 0xF1, 0x90], Box::new(|_| {}))
    }

    #[test]
    fn acquire_fills_distinct_slots() {
        let pool = ClientPool::new(4);
        let a = pool.acquire(context(0x0202)).unwrap();
        let b = pool.acquire(context(0x0203)).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn exhausted_pool_hands_the_context_back() {
        let pool = ClientPool::new(2);
        pool.acquire(context(0x0202)).unwrap();
        pool.acquire(context(0x0203)).unwrap();

        let rejected = pool.acquire(context(0x0204)).unwrap_err();
        assert_eq!(rejected.target_address, 0x0204);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn take_frees_the_slot_for_reuse() {
        let pool = ClientPool::new(1);
        let id = pool.acquire(context(0x0202)).unwrap();
        assert!(pool.take(id).is_some());
        assert!(pool.take(id).is_none());
        assert_eq!(pool.in_use(), 0);

        // The freed slot is immediately reusable.
        pool.acquire(context(0x0203)).unwrap();
    }

    #[test]
    fn pending_request_peeks_without_freeing() {
        let pool = ClientPool::new(2);
        let id = pool.acquire(context(0x0202)).unwrap();

        assert_eq!(
            pool.pending_request(id),
            Some((0x0202, vec![0x22, 0xF1, 0x90]))
        );
        assert_eq!(
            pool.pending_request(id),
            Some((0x0202, vec![0x22, 0xF1, 0x90]))
        );
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn complete_delivers_to_the_callback() {
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered);
        let context = ClientContext::new(
            0x0202,
            vec![0x31, 0x01, 0xF0, 0x05],
            Box::new(move |result| {
                assert!(matches!(result, Err(ClientError::Disconnected)));
                flag.store(true, Ordering::SeqCst);
            }),
        );

        context.complete(Err(ClientError::Disconnected));
        assert!(delivered.load(Ordering::SeqCst));
    }
}
