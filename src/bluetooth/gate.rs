//! Capability gate: whether the platform lets us use the radio right now
//! (permissions granted, radio switched on, app in a state that may scan).

pub trait TransportGate: Send + Sync {
    fn is_usable(&self) -> bool;
}

/// Gate for platforms with nothing to ask
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysUsable;

impl TransportGate for AlwaysUsable {
    fn is_usable(&self) -> bool {
        true
    }
}

impl<F> TransportGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_usable(&self) -> bool {
        self()
    }
}
