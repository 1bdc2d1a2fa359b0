//! Emissary gateway: the dispatcher that compiles cluster resources one at
//! a time and assembles the results into a consistent data-plane snapshot.

#![forbid(unsafe_code)]

pub mod compiled;
mod dispatcher;
pub mod gateway_api;
pub mod xds;

pub use compiled::{
    ClusterRef, CompiledCluster, CompiledConfig, CompiledItem, CompiledListener, CompiledLoadAssignment, CompiledRoute, Source,
};
pub use dispatcher::{resource_key, DispatchError, Dispatcher, DispatcherConfig, DEFAULT_ENDPOINT_RESOLVERS};
pub use xds::Snapshot;
