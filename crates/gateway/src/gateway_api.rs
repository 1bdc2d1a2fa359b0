//! Built-in transforms for the Gateway API `Gateway` and `HTTPRoute` kinds.

use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::compiled::{ClusterRef, CompiledConfig, CompiledItem, CompiledListener, CompiledRoute, Source};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::xds::{
    Filter, FilterChain, HeaderMatch, HeaderValueMatch, Listener, PathMatch, Route, RouteAction, RouteMatch, SocketAddress,
    WeightedCluster,
};

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "gateway.networking.k8s.io", version = "v1", kind = "Gateway", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default)]
    pub gateway_class_name: String,
    #[serde(default)]
    pub listeners: Vec<GatewayListener>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayListener {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    pub port: u16,
    pub protocol: String,
}

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "gateway.networking.k8s.io", version = "v1", kind = "HTTPRoute", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteSpec {
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<HTTPRouteRule>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteRule {
    #[serde(default)]
    pub matches: Vec<HTTPRouteMatch>,
    #[serde(default)]
    pub backend_refs: Vec<HTTPBackendRef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteMatch {
    #[serde(default)]
    pub path: Option<HTTPPathMatch>,
    #[serde(default)]
    pub headers: Vec<HTTPHeaderMatch>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HTTPPathMatch {
    #[serde(rename = "type", default = "default_path_type")]
    pub match_type: String,
    #[serde(default = "default_path")]
    pub value: String,
}

fn default_path_type() -> String { "PathPrefix".to_string() }
fn default_path() -> String { "/".to_string() }

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HTTPHeaderMatch {
    #[serde(rename = "type", default = "default_header_type")]
    pub match_type: String,
    pub name: String,
    pub value: String,
}

fn default_header_type() -> String { "Exact".to_string() }

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HTTPBackendRef {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub weight: Option<u32>,
}

/// Register the Gateway and HTTPRoute transforms.
pub fn register_builtin(dispatcher: &mut Dispatcher) -> Result<(), DispatchError> {
    dispatcher.register::<Gateway, _>("Gateway", |gw| Ok(compile_gateway(gw)))?;
    dispatcher.register::<HTTPRoute, _>("HTTPRoute", |route| Ok(compile_http_route(route)))
}

/// `<namespace>-<gateway>-<listener index>`; the route configuration shares the name.
pub fn gateway_listener_name(namespace: &str, gateway: &str, idx: usize) -> String {
    format!("{}-{}-{}", namespace, gateway, idx)
}

pub fn compile_gateway(gw: &Gateway) -> CompiledConfig {
    let src = Source::from_resource("Gateway", gw);
    let ns = gw.namespace().unwrap_or_default();
    let mut config = CompiledConfig::new(src.clone());
    for (i, l) in gw.spec.listeners.iter().enumerate() {
        let name = gateway_listener_name(&ns, &gw.name_any(), i);
        let item_src = src.nth("listener", i);
        let item = match l.protocol.as_str() {
            "HTTP" | "HTTPS" => CompiledItem::new(item_src),
            other => CompiledItem::with_error(item_src, format!("unsupported protocol {:?}", other)),
        };
        if item.has_error() {
            config.listeners.push(CompiledListener::failed(item));
            continue;
        }
        let listener = Listener {
            name: name.clone(),
            address: Some(SocketAddress { address: "0.0.0.0".to_string(), port_value: l.port }),
            filter_chains: vec![FilterChain { server_names: Vec::new(), filters: vec![Filter::hcm_rds(&name, &name)] }],
        };
        let domains = l.hostname.clone().map(|h| vec![h]).unwrap_or_else(|| vec!["*".to_string()]);
        config.listeners.push(CompiledListener::new(item, listener).with_domains(domains));
    }
    config
}

fn path_match(m: Option<&HTTPPathMatch>) -> Result<PathMatch, String> {
    let Some(m) = m else { return Ok(PathMatch::Prefix("/".to_string())) };
    match m.match_type.as_str() {
        "Exact" => Ok(PathMatch::Path(m.value.clone())),
        "PathPrefix" | "Prefix" => Ok(PathMatch::Prefix(m.value.clone())),
        "RegularExpression" => Ok(PathMatch::SafeRegex(m.value.clone())),
        other => Err(format!("unknown path match type {:?}", other)),
    }
}

fn header_match(h: &HTTPHeaderMatch) -> Result<HeaderMatch, String> {
    let value = match h.match_type.as_str() {
        "Exact" => HeaderValueMatch::ExactMatch(h.value.clone()),
        "RegularExpression" => HeaderValueMatch::SafeRegexMatch(h.value.clone()),
        other => return Err(format!("unknown header match type {:?}", other)),
    };
    Ok(HeaderMatch { name: h.name.clone(), value })
}

pub fn compile_http_route(route: &HTTPRoute) -> CompiledConfig {
    let src = Source::from_resource("HTTPRoute", route);
    let ns = route.namespace().unwrap_or_default();
    let mut config = CompiledConfig::new(src.clone());
    for (i, rule) in route.spec.rules.iter().enumerate() {
        let rule_src = src.nth("rule", i);
        let cluster_refs: Vec<ClusterRef> = rule
            .backend_refs
            .iter()
            .map(|b| ClusterRef {
                item: CompiledItem::new(rule_src.within(&format!("backend {}", b.name))),
                name: b.name.clone(),
                endpoint_path: format!("k8s/{}/{}", ns, b.name),
                resolver: None,
            })
            .collect();
        let action = match rule.backend_refs.as_slice() {
            [] => None,
            [one] => Some(RouteAction::Cluster(one.name.clone())),
            many => Some(RouteAction::WeightedClusters(
                many.iter().map(|b| WeightedCluster { name: b.name.clone(), weight: b.weight.unwrap_or(1) }).collect(),
            )),
        };
        let Some(action) = action else {
            config.routes.push(CompiledRoute {
                item: CompiledItem::with_error(rule_src, "rule has no backendRefs"),
                namespace: ns.clone(),
                routes: Vec::new(),
                cluster_refs: Vec::new(),
            });
            continue;
        };

        let matches: Vec<Option<&HTTPRouteMatch>> =
            if rule.matches.is_empty() { vec![None] } else { rule.matches.iter().map(Some).collect() };
        let mut routes = Vec::with_capacity(matches.len());
        let mut error = None;
        for (j, m) in matches.into_iter().enumerate() {
            let compiled = path_match(m.and_then(|m| m.path.as_ref())).and_then(|path| {
                let headers = m.map(|m| m.headers.iter().map(header_match).collect::<Result<Vec<_>, _>>()).transpose()?;
                Ok(RouteMatch { path, headers: headers.unwrap_or_default() })
            });
            match compiled {
                Ok(matcher) => routes.push(Route {
                    name: format!("{}-{}-rule-{}-match-{}", ns, route.name_any(), i, j),
                    matcher,
                    route: action.clone(),
                }),
                Err(e) => error = Some(e),
            }
        }
        let item = match error {
            Some(e) => CompiledItem::with_error(rule_src, e),
            None => CompiledItem::new(rule_src),
        };
        config.routes.push(CompiledRoute { item, namespace: ns.clone(), routes, cluster_refs });
    }
    config
}
