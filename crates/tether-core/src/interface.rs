//! Service interface descriptions.
//!
//! An [`Interface`] names a service and declares its methods. Interfaces may
//! extend other interfaces; [`Interface::method_table`] flattens the hierarchy
//! into a name-keyed [`MethodTable`] once, so calls never walk it.
//!
//! # Example
//!
//! ```rust
//! use tether_core::{Interface, Returns};
//!
//! let base = Interface::new("demo.Base").method("ping", 0, Returns::Void);
//! let echo = Interface::new("demo.Echo")
//!     .method("echo", 1, Returns::Value)
//!     .extends(base);
//!
//! let table = echo.method_table().unwrap();
//! assert!(table.get("ping").is_some());
//! assert_eq!(table.get("echo").unwrap().arity, 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::error::RpcError;
use crate::wire::MAX_ARGS;

/// Maximum service (interface) name length in bytes.
pub const MAX_SERVICE_NAME_LEN: usize = 256;

/// Maximum method name length in bytes.
pub const MAX_METHOD_NAME_LEN: usize = 128;

/// What a method hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Returns {
    Void,
    /// A value, which may still be null.
    Value,
}

impl fmt::Display for Returns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Returns::Void => write!(f, "void"),
            Returns::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    pub name: String,
    pub arity: usize,
    pub returns: Returns,
}

#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    methods: Vec<MethodSig>,
    parents: Vec<Arc<Interface>>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Interface {
            name: name.into(),
            methods: Vec::new(),
            parents: Vec::new(),
        }
    }

    /// Declare a method. Names are validated by [`Interface::method_table`].
    pub fn method(mut self, name: impl Into<String>, arity: usize, returns: Returns) -> Self {
        self.methods.push(MethodSig {
            name: name.into(),
            arity,
            returns,
        });
        self
    }

    pub fn extends(mut self, parent: impl Into<Arc<Interface>>) -> Self {
        self.parents.push(parent.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods declared directly on this interface.
    pub fn methods(&self) -> &[MethodSig] {
        &self.methods
    }

    pub fn parents(&self) -> &[Arc<Interface>] {
        &self.parents
    }

    /// Flatten this interface and all its ancestors into one table.
    ///
    /// An ancestor reachable along several paths is visited once; two
    /// different interfaces sharing a name are rejected. The wire format
    /// carries no overload discriminator, so a method name declared twice
    /// anywhere in the hierarchy rejects the whole interface.
    pub fn method_table(&self) -> Result<MethodTable, InterfaceError> {
        validate_service_name(&self.name)?;

        let mut methods: HashMap<String, (MethodSig, String)> = HashMap::new();
        let mut visited: HashMap<&str, &Interface> = HashMap::new();
        let mut queue: VecDeque<&Interface> = VecDeque::from([self]);

        while let Some(iface) = queue.pop_front() {
            if let Some(seen) = visited.insert(iface.name.as_str(), iface) {
                if !seen.declares_same(iface) {
                    return Err(InterfaceError::ConflictingDeclarations {
                        service: iface.name.clone(),
                    });
                }
                continue;
            }
            validate_service_name(&iface.name)?;

            for sig in &iface.methods {
                validate_method(&iface.name, sig)?;
                if let Some((_, first)) = methods.get(&sig.name) {
                    return Err(InterfaceError::OverloadedMethod {
                        method: sig.name.clone(),
                        first: first.clone(),
                        second: iface.name.clone(),
                    });
                }
                methods.insert(sig.name.clone(), (sig.clone(), iface.name.clone()));
            }

            queue.extend(iface.parents.iter().map(|parent| parent.as_ref()));
        }

        Ok(MethodTable {
            service: self.name.clone(),
            methods: methods
                .into_iter()
                .map(|(name, (sig, _))| (name, sig))
                .collect(),
        })
    }
}

impl Interface {
    /// Same methods and same parent names. Parents are compared when they are
    /// visited themselves.
    fn declares_same(&self, other: &Interface) -> bool {
        self.methods == other.methods
            && self.parents.len() == other.parents.len()
            && self
                .parents
                .iter()
                .zip(&other.parents)
                .all(|(a, b)| a.name == b.name)
    }
}

fn validate_service_name(name: &str) -> Result<(), InterfaceError> {
    if name.is_empty() {
        return Err(InterfaceError::EmptyServiceName);
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(InterfaceError::ServiceNameTooLong(name.len()));
    }
    Ok(())
}

fn validate_method(service: &str, sig: &MethodSig) -> Result<(), InterfaceError> {
    if sig.name.is_empty() {
        return Err(InterfaceError::EmptyMethodName {
            service: service.to_owned(),
        });
    }
    if sig.name.len() > MAX_METHOD_NAME_LEN {
        return Err(InterfaceError::MethodNameTooLong {
            service: service.to_owned(),
            len: sig.name.len(),
        });
    }
    if sig.arity > MAX_ARGS {
        return Err(InterfaceError::TooManyArguments {
            method: sig.name.clone(),
            arity: sig.arity,
        });
    }
    Ok(())
}

/// Every method reachable from one interface, keyed by name.
#[derive(Debug, Clone)]
pub struct MethodTable {
    service: String,
    methods: HashMap<String, MethodSig>,
}

impl MethodTable {
    /// Name of the interface the table was built from.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn get(&self, method: &str) -> Option<&MethodSig> {
        self.methods.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodSig> {
        self.methods.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceError {
    EmptyServiceName,
    ServiceNameTooLong(usize),
    EmptyMethodName { service: String },
    MethodNameTooLong { service: String, len: usize },
    TooManyArguments { method: String, arity: usize },
    OverloadedMethod {
        method: String,
        first: String,
        second: String,
    },
    /// Two different interfaces in one hierarchy use the same name.
    ConflictingDeclarations { service: String },
}

impl fmt::Display for InterfaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceError::EmptyServiceName => write!(f, "service name cannot be empty"),
            InterfaceError::ServiceNameTooLong(len) => write!(
                f,
                "service name is {len} bytes, the limit is {MAX_SERVICE_NAME_LEN}"
            ),
            InterfaceError::EmptyMethodName { service } => {
                write!(f, "method name cannot be empty (in {service})")
            }
            InterfaceError::MethodNameTooLong { service, len } => write!(
                f,
                "method name in {service} is {len} bytes, the limit is {MAX_METHOD_NAME_LEN}"
            ),
            InterfaceError::TooManyArguments { method, arity } => write!(
                f,
                "method {method} takes {arity} arguments, at most {MAX_ARGS} are supported"
            ),
            InterfaceError::OverloadedMethod {
                method,
                first,
                second,
            } => write!(
                f,
                "Method overloading is not supported yet. {method} is declared by {first} and {second}."
            ),
            InterfaceError::ConflictingDeclarations { service } => write!(
                f,
                "{service} appears twice in the hierarchy with different declarations"
            ),
        }
    }
}

impl std::error::Error for InterfaceError {}

impl From<InterfaceError> for RpcError {
    fn from(err: InterfaceError) -> Self {
        match err {
            InterfaceError::TooManyArguments { .. } | InterfaceError::OverloadedMethod { .. } => {
                RpcError::unimplemented(err.to_string())
            }
            _ => RpcError::invalid_argument(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn flattens_ancestors() {
        let root = Arc::new(Interface::new("demo.Root").method("ping", 0, Returns::Void));
        let left = Interface::new("demo.Left")
            .method("left", 1, Returns::Value)
            .extends(root.clone());
        let right = Interface::new("demo.Right")
            .method("right", 2, Returns::Value)
            .extends(root);
        let leaf = Interface::new("demo.Leaf")
            .method("leaf", 0, Returns::Void)
            .extends(left)
            .extends(right);

        // demo.Root is reachable twice but only contributes once.
        let table = leaf.method_table().unwrap();
        assert_eq!(table.service(), "demo.Leaf");
        assert_eq!(table.len(), 4);
        assert_eq!(table.get("right").unwrap().arity, 2);
        assert_eq!(table.get("ping").unwrap().returns, Returns::Void);
        assert!(!table.contains("pong"));
    }

    #[test]
    fn overloads_across_hierarchy_are_rejected() {
        let base = Interface::new("demo.Base").method("job", 0, Returns::Void);
        let derived = Interface::new("demo.Derived")
            .method("job", 1, Returns::Value)
            .extends(base);

        let err = derived.method_table().unwrap_err();
        assert!(matches!(err, InterfaceError::OverloadedMethod { ref method, .. } if method == "job"));

        let rpc: RpcError = err.into();
        assert_eq!(rpc.code, ErrorCode::Unimplemented);
        assert!(rpc.message.starts_with("Method overloading is not supported yet."));
    }

    #[test]
    fn overloads_within_one_interface_are_rejected() {
        let iface = Interface::new("demo.Twice")
            .method("job", 0, Returns::Void)
            .method("job", 0, Returns::Void);
        assert!(matches!(
            iface.method_table(),
            Err(InterfaceError::OverloadedMethod { .. })
        ));
    }

    #[test]
    fn arity_limit() {
        let ok = Interface::new("demo.Wide").method("m", MAX_ARGS, Returns::Void);
        assert!(ok.method_table().is_ok());

        let wide = Interface::new("demo.Wider").method("m", MAX_ARGS + 1, Returns::Void);
        let err: RpcError = wide.method_table().unwrap_err().into();
        assert_eq!(err.code, ErrorCode::Unimplemented);
    }

    #[test]
    fn names_are_validated() {
        let err: RpcError = Interface::new("").method_table().unwrap_err().into();
        assert_eq!(err.code, ErrorCode::InvalidArgument);

        let long = "s".repeat(MAX_SERVICE_NAME_LEN + 1);
        assert_eq!(
            Interface::new(long).method_table().unwrap_err(),
            InterfaceError::ServiceNameTooLong(MAX_SERVICE_NAME_LEN + 1)
        );

        let unnamed = Interface::new("demo.Svc").method("", 0, Returns::Void);
        assert!(matches!(
            unnamed.method_table(),
            Err(InterfaceError::EmptyMethodName { .. })
        ));

        let long_method = "m".repeat(MAX_METHOD_NAME_LEN + 1);
        let iface = Interface::new("demo.Svc").method(long_method, 0, Returns::Void);
        let err: RpcError = iface.method_table().unwrap_err().into();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn same_name_with_other_methods_is_rejected() {
        let first = Interface::new("demo.Shared").method("read", 1, Returns::Value);
        let second = Interface::new("demo.Shared").method("write", 1, Returns::Void);
        let iface = Interface::new("demo.Both").extends(first.clone()).extends(second);

        let err = iface.method_table().unwrap_err();
        assert_eq!(
            err,
            InterfaceError::ConflictingDeclarations {
                service: "demo.Shared".into()
            }
        );
        assert_eq!(RpcError::from(err).code, ErrorCode::InvalidArgument);

        // Equal copies reached along two paths are one interface.
        let diamond = Interface::new("demo.Diamond")
            .extends(Interface::new("demo.A").extends(first.clone()))
            .extends(Interface::new("demo.B").extends(first));
        assert_eq!(diamond.method_table().unwrap().len(), 1);

        // Parents count too.
        let plain = Interface::new("demo.Node");
        let extended = Interface::new("demo.Node").extends(Interface::new("demo.Extra"));
        let iface = Interface::new("demo.Top").extends(plain).extends(extended);
        assert!(matches!(
            iface.method_table(),
            Err(InterfaceError::ConflictingDeclarations { .. })
        ));
    }

    #[test]
    fn invalid_ancestor_fails_the_table() {
        let bad = Interface::new("demo.Bad").method("", 0, Returns::Void);
        let iface = Interface::new("demo.Good").extends(bad);
        assert!(iface.method_table().is_err());
    }
}
