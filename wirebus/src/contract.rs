//! Wire-type naming and multi-type decode registries.
//!
//! Peers identify a message schema on the wire by a short string, the *wire
//! type name*. The name is taken from [`Contract::CONTRACT_NAME`] when a
//! type declares one, and otherwise falls back to the type's short name
//! (the last path segment of `core::any::type_name`). Interoperating
//! clients must derive the same names.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;

use crate::format::{FormatError, WireFormat};

/// Gives a message type its identity on the wire.
///
/// The default leaves [`CONTRACT_NAME`](Contract::CONTRACT_NAME) unset, so
/// the type's short name is used. Set it to pin the wire name independently
/// of the Rust type name:
///
/// ```
/// use wirebus::Contract;
///
/// struct OrderPlaced;
/// impl Contract for OrderPlaced {
///     const CONTRACT_NAME: Option<&'static str> = Some("order.placed.v1");
/// }
///
/// assert_eq!(wirebus::contract::wire_name::<OrderPlaced>(), "order.placed.v1");
/// ```
pub trait Contract: 'static {
    /// Explicit wire name, overriding the short-name fallback.
    const CONTRACT_NAME: Option<&'static str> = None;
}

macro_rules! impl_contract {
    ($($ty:ty),* $(,)?) => {
        $(impl Contract for $ty {})*
    };
}

impl_contract!((), bool, u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, String);

/// The wire name of `T`: its contract name if declared, else its short name.
pub fn wire_name<T: Contract>() -> &'static str {
    match T::CONTRACT_NAME {
        Some(name) => name,
        None => short_type_name::<T>(),
    }
}

/// Last path segment of the full type name, with generic arguments dropped.
fn short_type_name<T: 'static>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Process-wide memo of resolved wire names.
///
/// The map is add-only: once a type resolves to a name it keeps that name
/// for the lifetime of the engine. Lookups race benignly; the compute is
/// pure, so a double insert of the same pair is harmless.
#[derive(Debug, Default)]
pub struct TypeNames {
    names: RwLock<HashMap<TypeId, &'static str>>,
}

impl TypeNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wire name for `T`, memoizing it on first use.
    pub fn resolve<T: Contract>(&self) -> &'static str {
        let id = TypeId::of::<T>();
        if let Some(name) = self.names.read().expect("type name map poisoned").get(&id) {
            return name;
        }
        let computed = wire_name::<T>();
        let mut names = self.names.write().expect("type name map poisoned");
        *names.entry(id).or_insert(computed)
    }

    pub fn len(&self) -> usize {
        self.names.read().expect("type name map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type DecodeFn =
    Arc<dyn Fn(WireFormat, &[u8]) -> Result<Box<dyn Any + Send>, FormatError> + Send + Sync>;

/// The set of message types a multi-type subscription understands, keyed by
/// wire name.
///
/// This is the explicit registration counterpart of attribute scanning:
/// each [`with`](KnownTypes::with) call installs a decoder producing the
/// type as `Box<dyn Any + Send>` for the subscriber to downcast.
#[derive(Clone, Default)]
pub struct KnownTypes {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl KnownTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under its wire name. Re-registering a name replaces the
    /// previous decoder.
    pub fn with<T>(mut self) -> Self
    where
        T: Contract + DeserializeOwned + Send,
    {
        let name = wire_name::<T>();
        let decode: DecodeFn = Arc::new(|format, bytes| {
            let value: T = format.from_bytes(bytes)?;
            Ok(Box::new(value) as Box<dyn Any + Send>)
        });
        if self.decoders.insert(name, decode).is_some() {
            tracing::warn!(wire_type = name, "replacing known-type decoder");
        }
        self
    }

    pub(crate) fn decoder(&self, wire_type: &str) -> Option<&DecodeFn> {
        self.decoders.get(wire_type)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, serde::Serialize, Deserialize)]
    struct PlainEvent {
        n: u8,
    }
    impl Contract for PlainEvent {}

    struct NamedEvent;
    impl Contract for NamedEvent {
        const CONTRACT_NAME: Option<&'static str> = Some("named.v2");
    }

    #[test]
    fn short_name_is_the_fallback() {
        assert_eq!(wire_name::<PlainEvent>(), "PlainEvent");
        assert_eq!(wire_name::<u32>(), "u32");
        assert_eq!(wire_name::<String>(), "String");
    }

    #[test]
    fn contract_name_wins() {
        assert_eq!(wire_name::<NamedEvent>(), "named.v2");
    }

    #[test]
    fn resolution_is_stable_across_calls() {
        let names = TypeNames::new();
        let first = names.resolve::<PlainEvent>();
        for _ in 0..16 {
            assert_eq!(names.resolve::<PlainEvent>(), first);
        }
        assert_eq!(names.len(), 1);
        names.resolve::<NamedEvent>();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn known_types_decode_by_wire_name() {
        let known = KnownTypes::new().with::<PlainEvent>();
        let bytes = WireFormat::Json.to_bytes(&PlainEvent { n: 3 }).unwrap();
        let decode = known.decoder("PlainEvent").expect("decoder registered");
        let value = decode(WireFormat::Json, &bytes).unwrap();
        let event = value.downcast::<PlainEvent>().unwrap();
        assert_eq!(*event, PlainEvent { n: 3 });
        assert!(known.decoder("Mystery").is_none());
    }
}
