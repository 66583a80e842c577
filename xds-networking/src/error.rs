use thiserror::Error;

/// Error type for listener generation, patching and simulation.
#[derive(Debug, Error)]
pub enum Error {
    /// An embedded proto could not be decoded.
    #[error("failed to decode {what}: {source}")]
    Decode {
        /// What was being decoded.
        what: &'static str,
        /// The decode failure.
        #[source]
        source: prost::DecodeError,
    },

    /// More than one filter chain matched a call.
    #[error("multiple filter chains matched on listener {listener}: {chains:?}")]
    MultipleFilterChains {
        /// The listener.
        listener: String,
        /// Names of the matching chains.
        chains: Vec<String>,
    },

    /// No filter chain matched a call and the listener has no default chain.
    #[error("no filter chain matched on listener {listener}")]
    NoFilterChain {
        /// The listener.
        listener: String,
    },

    /// No listener accepts the call.
    #[error("no listener for {address}:{port}")]
    NoListener {
        /// Destination address.
        address: String,
        /// Destination port.
        port: u16,
    },

    /// The chain refers to a route configuration that was not generated.
    #[error("route configuration {0} not found")]
    NoRouteConfiguration(String),

    /// No virtual host matches the host.
    #[error("no virtual host in {route_config} matches {host}")]
    NoVirtualHost {
        /// The route configuration searched.
        route_config: String,
        /// The host that was matched.
        host: String,
    },

    /// No route of the virtual host matches the path.
    #[error("no route in virtual host {virtual_host} matches {path}")]
    NoRoute {
        /// The virtual host searched.
        virtual_host: String,
        /// The path that was matched.
        path: String,
    },

    /// The selected route or chain does not forward to a cluster.
    #[error("{0} does not forward to a cluster")]
    NoCluster(String),

    /// A configuration value was invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error from the discovery server.
    #[error(transparent)]
    Server(#[from] xds_server::Error),
}

/// Result type alias for xDS networking operations.
pub type Result<T> = std::result::Result<T, Error>;
