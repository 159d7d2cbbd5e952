use serde_json::{json, Value};

use crate::domain::{BasicAuthScope, SecurityHeaders};

/// One desired proxy route, identified by `(host, pathPrefix, priority)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub service_id: String,
    /// Host matchers, already filtered of empty strings produced by
    /// unresolved tunnel templates.
    pub hosts: Vec<String>,
    pub path_prefix: Option<String>,
    pub strip_prefix: bool,
    pub dial: String,
    pub priority: i32,
    pub basic_auth: Option<BasicAuthRender>,
    pub security: Option<SecurityHeaders>,
    pub iframe_origin: Option<String>,
    pub delete_response_headers: Vec<String>,
    pub ingress_tag: Option<String>,
}

/// Credentials as they reach the proxy config: the password is already
/// bcrypted, the plaintext never enters the rendered route set.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicAuthRender {
    pub username: String,
    pub password_hash: String,
    pub realm: Option<String>,
    pub scope: BasicAuthScope,
}

impl RouteSpec {
    pub fn is_host_route(&self) -> bool {
        self.path_prefix.is_none()
    }

    fn route_id(&self) -> String {
        format!(
            "asd:{}:{}:{}",
            self.service_id,
            self.path_prefix.as_deref().unwrap_or(""),
            self.priority
        )
    }

    fn auth_applies(&self) -> bool {
        match &self.basic_auth {
            None => false,
            Some(auth) => match auth.scope {
                BasicAuthScope::All => true,
                BasicAuthScope::Hosts => self.is_host_route(),
                BasicAuthScope::Paths => !self.is_host_route(),
            },
        }
    }
}

/// Order routes the way the proxy should try them: priority first, then
/// longest path prefix so `/api/v2` beats `/api`.
pub fn sort_routes(routes: &mut [RouteSpec]) {
    routes.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| {
            let a_len = a.path_prefix.as_deref().map(str::len).unwrap_or(0);
            let b_len = b.path_prefix.as_deref().map(str::len).unwrap_or(0);
            b_len.cmp(&a_len).then_with(|| a.service_id.cmp(&b.service_id))
        })
    });
}

/// Render the desired route list as Caddy admin JSON. Routes with an empty
/// host list are dropped entirely.
pub fn render_routes(routes: &[RouteSpec]) -> Vec<Value> {
    routes
        .iter()
        .filter(|r| !r.hosts.is_empty())
        .map(render_route)
        .collect()
}

fn render_route(route: &RouteSpec) -> Value {
    let mut matcher = json!({ "host": route.hosts });
    if let Some(prefix) = &route.path_prefix {
        matcher["path"] = json!([format!("{}*", prefix)]);
    }

    let mut handlers: Vec<Value> = Vec::new();

    if let Some(auth) = route.basic_auth.as_ref().filter(|_| route.auth_applies()) {
        let mut provider = json!({
            "accounts": [{ "username": auth.username, "password": auth.password_hash }],
        });
        if let Some(realm) = &auth.realm {
            provider["realm"] = json!(realm);
        }
        handlers.push(json!({
            "handler": "authentication",
            "providers": { "http_basic": provider },
        }));
    }

    if let Some(headers) = render_headers(route) {
        handlers.push(headers);
    }

    if route.strip_prefix {
        if let Some(prefix) = &route.path_prefix {
            handlers.push(json!({
                "handler": "rewrite",
                "strip_path_prefix": prefix,
            }));
        }
    }

    if route
        .security
        .as_ref()
        .is_some_and(|s| s.compression)
    {
        handlers.push(json!({
            "handler": "encode",
            "encodings": { "gzip": {}, "zstd": {} },
        }));
    }

    handlers.push(json!({
        "handler": "reverse_proxy",
        "upstreams": [{ "dial": route.dial }],
    }));

    json!({
        "@id": route.route_id(),
        "match": [matcher],
        "handle": handlers,
    })
}

fn render_headers(route: &RouteSpec) -> Option<Value> {
    let mut set = serde_json::Map::new();
    let mut delete: Vec<Value> = Vec::new();

    if let Some(tag) = &route.ingress_tag {
        set.insert("X-Asd-Ingress".to_string(), json!([tag]));
    }
    if let Some(security) = &route.security {
        if security.hsts {
            set.insert(
                "Strict-Transport-Security".to_string(),
                json!(["max-age=31536000; includeSubDomains"]),
            );
        }
        if let Some(frame) = &security.frame_options {
            set.insert("X-Frame-Options".to_string(), json!([frame]));
        }
    }
    if let Some(origin) = &route.iframe_origin {
        set.insert(
            "Content-Security-Policy".to_string(),
            json!([format!("frame-ancestors {origin}")]),
        );
    }
    for header in &route.delete_response_headers {
        delete.push(json!(header));
    }

    if set.is_empty() && delete.is_empty() {
        return None;
    }
    let mut response = serde_json::Map::new();
    if !set.is_empty() {
        response.insert("set".to_string(), Value::Object(set));
    }
    if !delete.is_empty() {
        response.insert("deferred".to_string(), json!(true));
        response.insert("delete".to_string(), Value::Array(delete));
    }
    Some(json!({ "handler": "headers", "response": response }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str) -> RouteSpec {
        RouteSpec {
            service_id: id.to_string(),
            hosts: vec![format!("{id}.localhost")],
            path_prefix: None,
            strip_prefix: false,
            dial: "127.0.0.1:3000".to_string(),
            priority: 0,
            basic_auth: None,
            security: None,
            iframe_origin: None,
            delete_response_headers: Vec::new(),
            ingress_tag: None,
        }
    }

    #[test]
    fn renders_minimal_reverse_proxy_route() {
        let rendered = render_routes(&[route("myapp")]);
        assert_eq!(rendered.len(), 1);
        let r = &rendered[0];
        assert_eq!(r["match"][0]["host"][0], "myapp.localhost");
        let handlers = r["handle"].as_array().unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0]["handler"], "reverse_proxy");
        assert_eq!(handlers[0]["upstreams"][0]["dial"], "127.0.0.1:3000");
    }

    #[test]
    fn empty_host_list_drops_route() {
        let mut r = route("ghost");
        r.hosts.clear();
        assert!(render_routes(&[r]).is_empty());
    }

    #[test]
    fn strip_prefix_adds_rewrite_before_proxy() {
        let mut r = route("api");
        r.path_prefix = Some("/api".to_string());
        r.strip_prefix = true;
        let rendered = render_routes(&[r]);
        let handlers = rendered[0]["handle"].as_array().unwrap();
        assert_eq!(handlers[0]["handler"], "rewrite");
        assert_eq!(handlers[0]["strip_path_prefix"], "/api");
        assert_eq!(handlers[1]["handler"], "reverse_proxy");
        assert_eq!(rendered[0]["match"][0]["path"][0], "/api*");
    }

    #[test]
    fn basic_auth_scope_limits_enforcement() {
        let auth = BasicAuthRender {
            username: "dev".to_string(),
            password_hash: "$2b$10$hash".to_string(),
            realm: Some("asd".to_string()),
            scope: BasicAuthScope::Hosts,
        };
        let mut host_route = route("app");
        host_route.basic_auth = Some(auth.clone());
        let mut path_route = route("app");
        path_route.path_prefix = Some("/admin".to_string());
        path_route.basic_auth = Some(auth);

        let rendered = render_routes(&[host_route, path_route]);
        let host_handlers = rendered[0]["handle"].as_array().unwrap();
        assert_eq!(host_handlers[0]["handler"], "authentication");
        // Path routes fall outside the Hosts scope.
        let path_handlers = rendered[1]["handle"].as_array().unwrap();
        assert!(path_handlers.iter().all(|h| h["handler"] != "authentication"));
    }

    #[test]
    fn plaintext_password_never_reaches_rendered_config() {
        let mut r = route("app");
        r.basic_auth = Some(BasicAuthRender {
            username: "dev".to_string(),
            password_hash: "$2b$10$notplaintext".to_string(),
            realm: None,
            scope: BasicAuthScope::All,
        });
        let rendered = serde_json::to_string(&render_routes(&[r])).unwrap();
        assert!(rendered.contains("$2b$10$notplaintext"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn header_rules_render_set_and_delete() {
        let mut r = route("app");
        r.ingress_tag = Some("edge-1".to_string());
        r.delete_response_headers = vec!["Server".to_string(), "X-Powered-By".to_string()];
        r.security = Some(SecurityHeaders {
            hsts: true,
            frame_options: Some("DENY".to_string()),
            compression: false,
        });
        let rendered = render_routes(&[r]);
        let headers = &rendered[0]["handle"][0];
        assert_eq!(headers["handler"], "headers");
        assert_eq!(headers["response"]["set"]["X-Asd-Ingress"][0], "edge-1");
        assert_eq!(headers["response"]["set"]["X-Frame-Options"][0], "DENY");
        assert_eq!(headers["response"]["delete"][0], "Server");
    }

    #[test]
    fn sort_orders_by_priority_then_prefix_length() {
        let mut routes = vec![
            {
                let mut r = route("short");
                r.path_prefix = Some("/a".to_string());
                r
            },
            {
                let mut r = route("long");
                r.path_prefix = Some("/a/deep".to_string());
                r
            },
            {
                let mut r = route("vip");
                r.priority = 100;
                r
            },
        ];
        sort_routes(&mut routes);
        assert_eq!(routes[0].service_id, "vip");
        assert_eq!(routes[1].service_id, "long");
        assert_eq!(routes[2].service_id, "short");
    }
}
