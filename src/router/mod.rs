//! Resource tree and request dispatch.
pub mod request;
pub mod resource;
pub mod response;

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::message::header::{MessageClass, Method, Status};
use crate::message::option::ContentFormat;
use crate::message::packet::Packet;
use crate::observer::{ObserveOption, ObserveSequence, Observer};
pub use request::Request;
use resource::BoxedHandler;
pub use resource::Resource;
pub use response::{IntoResponse, Outcome, Response};

/// Path of the CoRE resource directory listing (RFC 6690).
pub const WELL_KNOWN_CORE: &str = ".well-known/core";

struct Node<Endpoint> {
    children: BTreeMap<String, Node<Endpoint>>,
    resource: Option<Resource<Endpoint>>,
    observers: HashSet<Observer<Endpoint>>,
    sequence: ObserveSequence,
}

impl<Endpoint> Default for Node<Endpoint> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            resource: None,
            observers: HashSet::new(),
            sequence: ObserveSequence::default(),
        }
    }
}

impl<Endpoint> Node<Endpoint> {
    fn find(&self, path: &str) -> Option<&Node<Endpoint>> {
        segments(path).try_fold(self, |node, segment| node.children.get(segment))
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Node<Endpoint>> {
        segments(path).try_fold(self, |node, segment| node.children.get_mut(segment))
    }

    fn collect_links<'a>(&'a self, prefix: &str, links: &mut Vec<(String, &'a Resource<Endpoint>)>) {
        if let Some(resource) = &self.resource {
            links.push((format!("/{}", prefix), resource));
        }
        for (segment, child) in &self.children {
            let path = if prefix.is_empty() {
                segment.clone()
            } else {
                format!("{}/{}", prefix, segment)
            };
            child.collect_links(&path, links);
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Result of routing one request.
#[derive(Debug)]
pub struct Dispatch {
    pub outcome: Outcome,
    /// Set when the request registered an observer; the response carries it.
    pub observe: Option<u32>,
    /// The request removed an existing observer.
    pub deregistered: bool,
}

impl Dispatch {
    fn respond(response: impl IntoResponse) -> Self {
        Self {
            outcome: Outcome::from(response),
            observe: None,
            deregistered: false,
        }
    }
}

/// A notification produced by [`Router::notifications`].
#[derive(Debug)]
pub struct Notification<Endpoint> {
    pub observer: Observer<Endpoint>,
    pub response: Response,
    pub sequence: u32,
}

/// The resource tree, shared between engines.
///
/// Routing matches whole path segments exactly.
pub struct Router<Endpoint> {
    root: Arc<RwLock<Node<Endpoint>>>,
}

impl<Endpoint> Clone for Router<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<Endpoint> Default for Router<Endpoint> {
    fn default() -> Self {
        Self {
            root: Arc::new(RwLock::new(Node::default())),
        }
    }
}

impl<Endpoint: Clone + Eq + Hash + 'static> Router<Endpoint> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resource` at `path`, replacing any previous one.
    pub fn add(&self, path: &str, resource: Resource<Endpoint>) -> &Self {
        let mut root = self.write();
        let node = segments(path).fold(&mut *root, |node, segment| {
            node.children.entry(segment.to_string()).or_default()
        });
        node.resource = Some(resource);
        self
    }

    /// Removes the resource at `path` together with its observers.
    pub fn remove(&self, path: &str) -> bool {
        let mut root = self.write();
        match root.find_mut(path) {
            Some(node) if node.resource.is_some() => {
                node.resource = None;
                node.observers.clear();
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.read()
            .find(path)
            .map_or(false, |node| node.resource.is_some())
    }

    /// Routes a request to its handler.
    ///
    /// Observe registration happens here: a successful GET with Observe = 0
    /// on an observable resource adds the requester, any other request from
    /// the same endpoint and token removes it.
    pub fn dispatch(&self, request: &Request<Endpoint>) -> Dispatch {
        let Some(method) = request.method() else {
            return Dispatch::respond(Status::BadRequest);
        };
        let path = request.path();

        let found = {
            let root = self.read();
            let found = root
                .find(&path)
                .and_then(|node| node.resource.as_ref())
                .map(|resource| (resource.handler_for(method), resource.is_observable()));
            found
        };
        let Some((handler, observable)) = found else {
            if method == Method::Get && path == WELL_KNOWN_CORE {
                return Dispatch::respond(self.discover(&request.query_as_vec()));
            }
            debug!("no resource at /{}", path);
            return Dispatch::respond(Status::NotFound);
        };
        let Some(handler) = handler else {
            return Dispatch::respond(Status::MethodNotAllowed);
        };

        let outcome = handler(request);
        let observer = Observer {
            peer: request.source.clone(),
            token: request.token().to_vec(),
        };
        let registering = method == Method::Get
            && observable
            && request.observe_flag() == Some(Ok(ObserveOption::Register))
            && matches!(&outcome, Outcome::Respond(r) if r.status().is_success());

        let mut root = self.write();
        let Some(node) = root.find_mut(&path) else {
            return Dispatch {
                outcome,
                observe: None,
                deregistered: false,
            };
        };
        if registering {
            if node.observers.insert(observer) {
                debug!("observer added to /{}", path);
            }
            Dispatch {
                outcome,
                observe: Some(node.sequence.current()),
                deregistered: false,
            }
        } else {
            let deregistered = node.observers.remove(&observer);
            if deregistered {
                debug!("observer removed from /{}", path);
            }
            Dispatch {
                outcome,
                observe: None,
                deregistered,
            }
        }
    }

    pub fn remove_observer(&self, path: &str, observer: &Observer<Endpoint>) -> bool {
        self.write()
            .find_mut(path)
            .map_or(false, |node| node.observers.remove(observer))
    }

    pub fn observer_count(&self, path: &str) -> usize {
        self.read().find(path).map_or(0, |node| node.observers.len())
    }

    /// Renders the GET handler's current representation for every observer
    /// of `path`, advancing the resource's sequence number.
    ///
    /// Observers that receive an error response are removed.
    pub fn notifications(&self, path: &str) -> Vec<Notification<Endpoint>> {
        let (handler, observers, sequence) = {
            let mut root = self.write();
            let Some(node) = root.find_mut(path) else {
                return Vec::new();
            };
            let handler: Option<BoxedHandler<Endpoint>> = node
                .resource
                .as_ref()
                .and_then(|r| r.handler_for(Method::Get));
            let Some(handler) = handler.filter(|_| !node.observers.is_empty()) else {
                return Vec::new();
            };
            let sequence = node.sequence.advance();
            let observers: Vec<_> = node.observers.iter().cloned().collect();
            (handler, observers, sequence)
        };

        let mut notifications = Vec::new();
        for observer in observers {
            let mut message = Packet::new();
            message.header.code = MessageClass::Request(Method::Get);
            message.set_token(observer.token.clone());
            message.set_path(path);
            let request = Request::new(observer.peer.clone(), message);
            let Outcome::Respond(response) = handler(&request) else {
                continue;
            };
            if !response.status().is_success() {
                self.remove_observer(path, &observer);
            }
            notifications.push(Notification {
                observer,
                response,
                sequence,
            });
        }
        notifications
    }

    /// The `/.well-known/core` listing, filtered by `attr=value` queries.
    fn discover(&self, queries: &[String]) -> Response {
        let root = self.read();
        let mut links = Vec::new();
        root.collect_links("", &mut links);
        let body = links
            .into_iter()
            .filter(|(href, resource)| queries.iter().all(|q| matches_filter(href, resource, q)))
            .map(|(href, resource)| {
                let attributes: String = resource
                    .link_attributes()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                format!("<{}>{}", href, attributes)
            })
            .collect::<Vec<_>>()
            .join(",");
        Response::new()
            .set_payload(body.into_bytes())
            .set_content_format(ContentFormat::ApplicationLinkFormat)
    }

    fn read(&self) -> RwLockReadGuard<'_, Node<Endpoint>> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Node<Endpoint>> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Matches one `name=value` discovery filter; a trailing `*` matches a prefix.
fn matches_filter<Endpoint: 'static>(href: &str, resource: &Resource<Endpoint>, query: &str) -> bool {
    let Some((name, pattern)) = query.split_once('=') else {
        return true;
    };
    let matches = |value: &str| match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern,
    };
    if name == "href" {
        return matches(href);
    }
    resource
        .link_attributes()
        .iter()
        .filter(|a| a.name == name)
        .filter_map(|a| a.value.as_deref())
        .any(|value| value.split_whitespace().any(&matches))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::option::CoapOption;

    fn request(method: Method, path: &str) -> Request<u8> {
        let mut message = Packet::new();
        message.header.code = MessageClass::Request(method);
        message.set_path(path);
        message.set_token(vec![0xAB]);
        Request::new(1, message)
    }

    fn status(dispatch: &Dispatch) -> Status {
        match &dispatch.outcome {
            Outcome::Respond(response) => response.status(),
            Outcome::Defer => panic!("deferred"),
        }
    }

    #[test]
    fn test_exact_routing() {
        let router = Router::new();
        router.add("/temp", Resource::new().get(|_: &Request<u8>| "23.5"));
        router.add("/a/b", Resource::new().put(|_: &Request<u8>| Status::Changed));

        let dispatch = router.dispatch(&request(Method::Get, "temp"));
        assert_eq!(
            dispatch.outcome,
            Outcome::Respond(Response::new().set_payload(b"23.5".to_vec()))
        );
        assert_eq!(status(&router.dispatch(&request(Method::Get, "temp/x"))), Status::NotFound);
        assert_eq!(status(&router.dispatch(&request(Method::Get, "tem"))), Status::NotFound);
        assert_eq!(status(&router.dispatch(&request(Method::Get, "a"))), Status::NotFound);
        assert_eq!(
            status(&router.dispatch(&request(Method::Get, "a/b"))),
            Status::MethodNotAllowed
        );
        assert_eq!(status(&router.dispatch(&request(Method::Put, "/a/b/"))), Status::Changed);

        assert!(router.remove("a/b"));
        assert!(!router.contains("a/b"));
        assert_eq!(status(&router.dispatch(&request(Method::Put, "a/b"))), Status::NotFound);
    }

    #[test]
    fn test_observe_registration() {
        let router = Router::new();
        router.add(
            "temp",
            Resource::new()
                .get(|_: &Request<u8>| "23.5")
                .put(|_: &Request<u8>| Status::Changed)
                .observable(true),
        );
        router.add("plain", Resource::new().get(|_: &Request<u8>| "x"));

        let mut register = request(Method::Get, "temp");
        register.message.set_observe_value(0);
        assert_eq!(router.dispatch(&register).observe, Some(0));
        assert_eq!(router.observer_count("temp"), 1);

        // the same endpoint and token registers once
        assert_eq!(router.dispatch(&register).observe, Some(0));
        assert_eq!(router.observer_count("temp"), 1);

        let notifications = router.notifications("temp");
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].sequence, 1);
        assert_eq!(notifications[0].observer.token, vec![0xAB]);
        assert_eq!(router.notifications("temp")[0].sequence, 2);

        let mut deregister = request(Method::Get, "temp");
        deregister.message.set_observe_value(1);
        let dispatch = router.dispatch(&deregister);
        assert_eq!(dispatch.observe, None);
        assert!(dispatch.deregistered);
        assert_eq!(router.observer_count("temp"), 0);
        assert!(!router.dispatch(&deregister).deregistered);
        assert!(router.notifications("temp").is_empty());

        let mut plain = request(Method::Get, "plain");
        plain.message.set_observe_value(0);
        assert_eq!(router.dispatch(&plain).observe, None);
        assert_eq!(router.observer_count("plain"), 0);

        router.dispatch(&register);
        router.dispatch(&request(Method::Put, "temp"));
        assert_eq!(router.observer_count("temp"), 0);
    }

    #[test]
    fn test_error_notification_removes_observer() {
        let router = Router::new();
        let available = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = available.clone();
        router.add(
            "door",
            Resource::new()
                .get(move |_: &Request<u8>| {
                    if flag.load(std::sync::atomic::Ordering::SeqCst) {
                        Ok("open")
                    } else {
                        Err(Status::ServiceUnavailable)
                    }
                })
                .observable(true),
        );
        let mut register = request(Method::Get, "door");
        register.message.set_observe_value(0);
        router.dispatch(&register);

        available.store(false, std::sync::atomic::Ordering::SeqCst);
        let notifications = router.notifications("door");
        assert_eq!(notifications[0].response.status(), Status::ServiceUnavailable);
        assert_eq!(router.observer_count("door"), 0);
    }

    #[test]
    fn test_discovery() {
        let router = Router::new();
        router.add(
            "sensors/temp",
            Resource::new()
                .get(|_: &Request<u8>| "23.5")
                .resource_type("temperature-c")
                .content_format(0)
                .observable(true),
        );
        router.add(
            "sensors/light",
            Resource::new()
                .get(|_: &Request<u8>| "100")
                .resource_type("light-lux")
                .interface("sensor"),
        );

        let dispatch = router.dispatch(&request(Method::Get, WELL_KNOWN_CORE));
        let Outcome::Respond(response) = dispatch.outcome else {
            panic!("deferred");
        };
        assert_eq!(
            response.content_format,
            Some(ContentFormat::ApplicationLinkFormat)
        );
        assert_eq!(
            String::from_utf8(response.payload.unwrap()).unwrap(),
            "</sensors/light>;rt=\"light-lux\";if=\"sensor\",\
             </sensors/temp>;rt=\"temperature-c\";ct=0;obs"
        );

        let mut filtered = request(Method::Get, WELL_KNOWN_CORE);
        filtered
            .message
            .add_option(CoapOption::UriQuery, b"rt=temp*".to_vec());
        let Outcome::Respond(response) = router.dispatch(&filtered).outcome else {
            panic!("deferred");
        };
        assert_eq!(
            response.payload,
            Some(b"</sensors/temp>;rt=\"temperature-c\";ct=0;obs".to_vec())
        );

        let mut by_href = request(Method::Get, WELL_KNOWN_CORE);
        by_href
            .message
            .add_option(CoapOption::UriQuery, b"href=/sensors/l*".to_vec());
        let Outcome::Respond(response) = router.dispatch(&by_href).outcome else {
            panic!("deferred");
        };
        assert_eq!(
            response.payload,
            Some(b"</sensors/light>;rt=\"light-lux\";if=\"sensor\"".to_vec())
        );
    }
}
