//! Physical-link lifecycle hooks

/// Observer for the client's physical link. All methods have empty
/// defaults; implement only what the embedder cares about.
pub trait LinkListener: Send + Sync {
    /// The link to the relay was established.
    fn connected(&self) {}

    /// The link ended, cleanly or not; every logical connection on it has
    /// already been failed or closed.
    fn disconnected(&self) {}

    /// Dialing the relay failed; no link was retained.
    fn failed(&self, _err: &std::io::Error) {}
}
