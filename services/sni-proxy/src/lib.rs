pub mod config;
pub mod error;
pub mod proxy;

pub use error::{ConfigError, ProxyError, SniError};
pub use proxy::{
    forward, inject, Accept, AttemptedWrite, Dialer, ForwardStats, InjectListener, Injector,
    ListenerClosed, ProbeOutcome, Proxy, ProxyOptions, ProxyState, ProxyStats, ReadOnlyStream,
    RouteSource, Router, SniExtractor, SniProbe, TlsConfigFactory,
};
