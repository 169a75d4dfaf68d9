//! Service registry.
//!
//! Services declare their method table up front. The table is validated
//! when the service is registered, and inbound calls are matched against
//! it by path, service group and service version.

use crate::status::Status;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Message cardinality of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl CallKind {
    pub fn is_unary(self) -> bool {
        self == CallKind::Unary
    }

    pub fn client_streams(self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::BidiStreaming)
    }

    pub fn server_streams(self) -> bool {
        matches!(self, CallKind::ServerStreaming | CallKind::BidiStreaming)
    }
}

/// One method of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: CallKind,
    /// Fully qualified request message type.
    pub input_type: String,
    /// Fully qualified response message type.
    pub output_type: String,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: CallKind,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            input_type: input_type.into(),
            output_type: output_type.into(),
        }
    }

    pub fn unary(
        name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self::new(name, CallKind::Unary, input_type, output_type)
    }
}

/// A service and the group/version it is registered under.
///
/// An empty group or version matches any value a caller sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub group: String,
    pub version: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: String::new(),
            version: String::new(),
            methods: Vec::new(),
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Request path of a method: `/{service}/{method}`.
    pub fn path_of(&self, method: &MethodDescriptor) -> String {
        format!("/{}/{}", self.name, method.name)
    }
}

/// Group and version supplied by a caller. Empty means not supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub group: String,
    pub version: String,
}

impl ServiceIdentity {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }
}

/// Errors raised while registering a service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service name must not be empty")]
    EmptyServiceName,
    #[error("service {service} declares no methods")]
    NoMethods { service: String },
    #[error("invalid name {name:?}: names must not contain '/' or whitespace")]
    InvalidName { name: String },
    #[error("service {service} has a method with an empty name")]
    EmptyMethodName { service: String },
    #[error("service {service} declares method {method} more than once")]
    DuplicateMethod { service: String, method: String },
    #[error("{path} is already registered for group {group:?} version {version:?}")]
    DuplicateRoute {
        path: String,
        group: String,
        version: String,
    },
}

/// A registered method bound to its handler.
#[derive(Debug, Clone)]
pub struct Route<H> {
    pub path: String,
    pub group: String,
    pub version: String,
    pub method: Arc<MethodDescriptor>,
    pub handler: H,
}

impl<H> Route<H> {
    fn matches(&self, identity: &ServiceIdentity) -> bool {
        (self.group.is_empty() || self.group == identity.group)
            && (self.version.is_empty() || self.version == identity.version)
    }

    fn specificity(&self) -> u8 {
        u8::from(!self.group.is_empty()) + u8::from(!self.version.is_empty())
    }
}

/// Method table of every registered service.
#[derive(Debug)]
pub struct Registry<H> {
    routes: HashMap<String, Vec<Route<H>>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<H: Clone> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a service. Nothing is registered on error.
    pub fn register(&mut self, service: ServiceDescriptor, handler: H) -> Result<(), RegistryError> {
        self.validate(&service)?;

        for method in &service.methods {
            let path = service.path_of(method);
            self.routes.entry(path.clone()).or_default().push(Route {
                path,
                group: service.group.clone(),
                version: service.version.clone(),
                method: Arc::new(method.clone()),
                handler: handler.clone(),
            });
        }
        Ok(())
    }

    fn validate(&self, service: &ServiceDescriptor) -> Result<(), RegistryError> {
        if service.name.is_empty() {
            return Err(RegistryError::EmptyServiceName);
        }
        if !valid_name(&service.name) {
            return Err(RegistryError::InvalidName {
                name: service.name.clone(),
            });
        }
        if service.methods.is_empty() {
            return Err(RegistryError::NoMethods {
                service: service.name.clone(),
            });
        }

        for (idx, method) in service.methods.iter().enumerate() {
            if method.name.is_empty() {
                return Err(RegistryError::EmptyMethodName {
                    service: service.name.clone(),
                });
            }
            if !valid_name(&method.name) {
                return Err(RegistryError::InvalidName {
                    name: method.name.clone(),
                });
            }
            if service.methods[..idx].iter().any(|m| m.name == method.name) {
                return Err(RegistryError::DuplicateMethod {
                    service: service.name.clone(),
                    method: method.name.clone(),
                });
            }

            let path = service.path_of(method);
            let taken = self.routes.get(&path).is_some_and(|routes| {
                routes
                    .iter()
                    .any(|r| r.group == service.group && r.version == service.version)
            });
            if taken {
                return Err(RegistryError::DuplicateRoute {
                    path,
                    group: service.group.clone(),
                    version: service.version.clone(),
                });
            }
        }
        Ok(())
    }

    /// Find the route for a path and caller identity.
    ///
    /// When several registrations match, the most specific one wins.
    pub fn lookup(&self, path: &str, identity: &ServiceIdentity) -> Result<&Route<H>, Status> {
        let routes = self
            .routes
            .get(path)
            .ok_or_else(|| Status::unimplemented(format!("method not found: {path}")))?;

        routes
            .iter()
            .filter(|r| r.matches(identity))
            .max_by_key(|r| r.specificity())
            .ok_or_else(|| {
                Status::unimplemented(format!(
                    "no service matches group {:?} version {:?} for {path}",
                    identity.group, identity.version
                ))
            })
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn valid_name(name: &str) -> bool {
    !name.contains('/') && !name.chars().any(char::is_whitespace)
}
