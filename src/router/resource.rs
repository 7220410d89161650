use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::request::Request;
use super::response::Outcome;
use crate::message::header::Method;

pub type BoxedHandler<Endpoint> = Arc<dyn Fn(&Request<Endpoint>) -> Outcome + Send + Sync>;

/// A link-format attribute of a resource, e.g. `rt="temperature"` or `ct=0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAttribute {
    pub name: String,
    pub value: Option<String>,
    quoted: bool,
}

impl fmt::Display for LinkAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.value, self.quoted) {
            (None, _) => write!(f, ";{}", self.name),
            (Some(value), true) => write!(f, ";{}=\"{}\"", self.name, value),
            (Some(value), false) => write!(f, ";{}={}", self.name, value),
        }
    }
}

/// Handlers and metadata attached to a path.
pub struct Resource<Endpoint> {
    handlers: BTreeMap<Method, BoxedHandler<Endpoint>>,
    attributes: Vec<LinkAttribute>,
    observable: bool,
}

impl<Endpoint> Default for Resource<Endpoint> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
            attributes: Vec::new(),
            observable: false,
        }
    }
}

impl<Endpoint: 'static> Resource<Endpoint> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<F, R>(mut self, method: Method, handler: F) -> Self
    where
        F: Fn(&Request<Endpoint>) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        self.handlers
            .insert(method, Arc::new(move |request: &Request<Endpoint>| -> Outcome {
                handler(request).into()
            }));
        self
    }

    pub fn get<F, R>(self, handler: F) -> Self
    where
        F: Fn(&Request<Endpoint>) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        self.handler(Method::Get, handler)
    }

    pub fn post<F, R>(self, handler: F) -> Self
    where
        F: Fn(&Request<Endpoint>) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        self.handler(Method::Post, handler)
    }

    pub fn put<F, R>(self, handler: F) -> Self
    where
        F: Fn(&Request<Endpoint>) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        self.handler(Method::Put, handler)
    }

    pub fn delete<F, R>(self, handler: F) -> Self
    where
        F: Fn(&Request<Endpoint>) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        self.handler(Method::Delete, handler)
    }

    /// Allows clients to observe the resource with GET and Observe = 0.
    pub fn observable(mut self, observable: bool) -> Self {
        self.observable = observable;
        self
    }

    /// Adds a quoted attribute, e.g. `rt`, `if` or `title`.
    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.push(LinkAttribute {
            name: name.to_string(),
            value: Some(value.to_string()),
            quoted: true,
        });
        self
    }

    pub fn resource_type(self, rt: &str) -> Self {
        self.attribute("rt", rt)
    }

    pub fn interface(self, interface: &str) -> Self {
        self.attribute("if", interface)
    }

    pub fn title(self, title: &str) -> Self {
        self.attribute("title", title)
    }

    pub fn content_format(mut self, ct: u16) -> Self {
        self.attributes.push(LinkAttribute {
            name: "ct".to_string(),
            value: Some(ct.to_string()),
            quoted: false,
        });
        self
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    pub(crate) fn handler_for(&self, method: Method) -> Option<BoxedHandler<Endpoint>> {
        self.handlers.get(&method).cloned()
    }

    /// Attributes as listed by discovery, with `obs` for observable resources.
    pub fn link_attributes(&self) -> Vec<LinkAttribute> {
        let mut attributes = self.attributes.clone();
        if self.observable {
            attributes.push(LinkAttribute {
                name: "obs".to_string(),
                value: None,
                quoted: false,
            });
        }
        attributes
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::header::Status;

    #[test]
    fn test_link_attributes() {
        let resource: Resource<u8> = Resource::new()
            .get(|_: &Request<u8>| "x")
            .resource_type("temperature-c")
            .content_format(0)
            .observable(true);
        let rendered: String = resource
            .link_attributes()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(rendered, ";rt=\"temperature-c\";ct=0;obs");
        assert!(resource.handler_for(Method::Get).is_some());
        assert!(resource.handler_for(Method::Put).is_none());
    }

    #[test]
    fn test_handler_outcome() {
        let resource: Resource<u8> = Resource::new()
            .put(|_: &Request<u8>| Status::Changed)
            .post(|_: &Request<u8>| Outcome::Defer);
        let request = Request::new(0u8, Default::default());
        let put = resource.handler_for(Method::Put).unwrap();
        assert_eq!(put(&request), Outcome::from(Status::Changed));
        let post = resource.handler_for(Method::Post).unwrap();
        assert_eq!(post(&request), Outcome::Defer);
    }
}
