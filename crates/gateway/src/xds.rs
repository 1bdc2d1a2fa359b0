//! Data-plane resources emitted by the dispatcher. Shapes follow the
//! envoy v3 API closely enough to be serialized straight into ADS payloads.

use serde::{Deserialize, Serialize};

pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketAddress {
    pub address: String,
    pub port_value: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddress>,
    #[serde(default)]
    pub filter_chains: Vec<FilterChain>,
}

impl Listener {
    pub fn named(name: impl Into<String>) -> Self { Self { name: name.into(), ..Self::default() } }

    /// The RDS route configuration name, if an HTTP connection manager on
    /// this listener is configured for RDS.
    pub fn rds_name(&self) -> Option<&str> {
        self.filter_chains
            .iter()
            .flat_map(|fc| fc.filters.iter())
            .filter(|f| f.name == HTTP_CONNECTION_MANAGER)
            .find_map(|f| match &f.typed_config {
                FilterConfig::HttpConnectionManager(hcm) => match &hcm.route_specifier {
                    RouteSpecifier::Rds { route_config_name } => Some(route_config_name.as_str()),
                    RouteSpecifier::RouteConfig(_) => None,
                },
                FilterConfig::Opaque(_) => None,
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterChain {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_names: Vec<String>,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub name: String,
    pub typed_config: FilterConfig,
}

impl Filter {
    /// An HTTP connection manager that fetches its routes over RDS.
    pub fn hcm_rds(stat_prefix: impl Into<String>, route_config_name: impl Into<String>) -> Self {
        Self {
            name: HTTP_CONNECTION_MANAGER.to_string(),
            typed_config: FilterConfig::HttpConnectionManager(HttpConnectionManager {
                stat_prefix: stat_prefix.into(),
                route_specifier: RouteSpecifier::Rds { route_config_name: route_config_name.into() },
                http_filters: vec!["envoy.filters.http.router".to_string()],
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterConfig {
    HttpConnectionManager(HttpConnectionManager),
    Opaque(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConnectionManager {
    pub stat_prefix: String,
    #[serde(flatten)]
    pub route_specifier: RouteSpecifier,
    #[serde(default)]
    pub http_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteSpecifier {
    #[serde(rename_all = "camelCase")]
    Rds { route_config_name: String },
    RouteConfig(RouteConfiguration),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfiguration {
    pub name: String,
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathMatch {
    Prefix(String),
    Path(String),
    SafeRegex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatch {
    pub name: String,
    #[serde(flatten)]
    pub value: HeaderValueMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HeaderValueMatch {
    ExactMatch(String),
    SafeRegexMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
    #[serde(flatten)]
    pub path: PathMatch,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteAction {
    Cluster(String),
    WeightedClusters(Vec<WeightedCluster>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    pub route: RouteAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    /// Seconds.
    pub connect_timeout: u64,
    #[serde(rename = "type")]
    pub discovery_type: String,
    pub eds_cluster_config: EdsClusterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdsClusterConfig {
    /// Always ADS.
    pub eds_config: String,
    pub service_name: String,
}

impl Cluster {
    /// An EDS cluster whose endpoints are served under `path`.
    pub fn eds(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_timeout: 10,
            discovery_type: "EDS".to_string(),
            eds_cluster_config: EdsClusterConfig { eds_config: "ads".to_string(), service_name: path.into() },
        }
    }

    /// The load assignment name this cluster looks up.
    pub fn eds_name(&self) -> &str {
        if self.eds_cluster_config.service_name.is_empty() { &self.name } else { &self.eds_cluster_config.service_name }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LbEndpoint {
    pub address: SocketAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalityLbEndpoints {
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityLbEndpoints>,
}

impl ClusterLoadAssignment {
    pub fn empty(cluster_name: impl Into<String>) -> Self { Self { cluster_name: cluster_name.into(), endpoints: Vec::new() } }
}

/// One complete, versioned set of data-plane resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: String,
    pub endpoints: Vec<ClusterLoadAssignment>,
    pub clusters: Vec<Cluster>,
    pub routes: Vec<RouteConfiguration>,
    pub listeners: Vec<Listener>,
}

impl Snapshot {
    /// Every RDS listener names a route configuration present in the
    /// snapshot and every EDS cluster has its load assignment.
    pub fn consistent(&self) -> Result<(), String> {
        for l in &self.listeners {
            if let Some(rds) = l.rds_name() {
                if rds.is_empty() {
                    return Err(format!("listener {:?} uses RDS without a route configuration name", l.name));
                }
                if !self.routes.iter().any(|r| r.name == rds) {
                    return Err(format!("listener {:?} references missing route configuration {:?}", l.name, rds));
                }
            }
        }
        for c in &self.clusters {
            let want = c.eds_name();
            if !self.endpoints.iter().any(|la| la.cluster_name == want) {
                return Err(format!("cluster {:?} references missing load assignment {:?}", c.name, want));
            }
        }
        Ok(())
    }

    pub fn listener(&self, name: &str) -> Option<&Listener> { self.listeners.iter().find(|l| l.name == name) }

    pub fn route_configuration(&self, name: &str) -> Option<&RouteConfiguration> { self.routes.iter().find(|r| r.name == name) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rds_listener(name: &str, rds: &str) -> Listener {
        Listener {
            name: name.into(),
            address: Some(SocketAddress { address: "0.0.0.0".into(), port_value: 8080 }),
            filter_chains: vec![FilterChain { server_names: vec![], filters: vec![Filter::hcm_rds(name, rds)] }],
        }
    }

    #[test]
    fn rds_name_is_read_from_the_connection_manager() {
        assert_eq!(rds_listener("l", "rc").rds_name(), Some("rc"));
        assert_eq!(Listener::named("plain").rds_name(), None);
    }

    #[test]
    fn consistency_requires_routes_and_assignments() {
        let mut snap = Snapshot { version: "v1".into(), listeners: vec![rds_listener("l", "rc")], ..Default::default() };
        assert!(snap.consistent().is_err());
        snap.routes.push(RouteConfiguration { name: "rc".into(), virtual_hosts: vec![] });
        assert!(snap.consistent().is_ok());

        snap.clusters.push(Cluster::eds("c", "k8s/default/c"));
        assert!(snap.consistent().is_err());
        snap.endpoints.push(ClusterLoadAssignment::empty("k8s/default/c"));
        assert!(snap.consistent().is_ok());

        snap.listeners.push(rds_listener("bad", ""));
        assert!(snap.consistent().unwrap_err().contains("without a route configuration name"));
    }

    #[test]
    fn connection_manager_serializes_rds_inline() {
        let v = serde_json::to_value(Filter::hcm_rds("http", "rc")).unwrap();
        assert_eq!(v["typedConfig"]["rds"]["routeConfigName"], "rc");
        assert_eq!(v["typedConfig"]["statPrefix"], "http");
    }
}
