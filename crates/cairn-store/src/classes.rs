//! Class-method dispatch.
//!
//! A class method is a named callable invoked atomically against an object.
//! The registry is an explicit handle passed to the store at construction,
//! not a process-global table, so tests can compose their own method sets.

use std::collections::HashMap;
use std::sync::Arc;

use cairn_core::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};

use crate::mem::ObjectData;

/// How a class method interacts with its object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassMethodFlags {
    /// The method mutates the object (bumps its version).
    pub write: bool,
    /// The method may create the object if it does not exist.
    pub creates: bool,
}

/// A registered class method body.
pub type ClassMethodFn = dyn Fn(&mut ObjectData, &[u8]) -> Result<Vec<u8>> + Send + Sync;

/// Registry of `(class, method)` callables.
pub struct ClassRegistry {
    methods: HashMap<(String, String), (ClassMethodFlags, Arc<ClassMethodFn>)>,
}

impl ClassRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { methods: HashMap::new() }
    }

    /// Creates a registry with the built-in classes registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        lock::register(&mut registry);
        registry
    }

    /// Registers a method under `(class, method)`.
    pub fn register(
        &mut self,
        class: &str,
        method: &str,
        flags: ClassMethodFlags,
        body: Arc<ClassMethodFn>,
    ) {
        self.methods.insert((class.to_string(), method.to_string()), (flags, body));
    }

    /// Looks up a method. Fails `NotSupported` for unknown methods.
    pub fn get(
        &self,
        class: &str,
        method: &str,
    ) -> Result<(&ClassMethodFlags, &Arc<ClassMethodFn>)> {
        self.methods
            .get(&(class.to_string(), method.to_string()))
            .map(|(flags, body)| (flags, body))
            .ok_or_else(|| {
                Error::new(ErrorCode::NotSupported, format!("no class method {class}.{method}"))
            })
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// The built-in advisory lock class.
///
/// Lock state lives in an extended attribute on the locked object, so it is
/// manipulated atomically under the object lock like any other class-method
/// state.
pub mod lock {
    use super::*;

    /// Class name.
    pub const CLASS: &str = "lock";
    /// Acquire method name.
    pub const LOCK: &str = "lock";
    /// Release method name.
    pub const UNLOCK: &str = "unlock";
    /// Introspection method name.
    pub const GET_INFO: &str = "get_info";

    /// Arguments to `lock.lock`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LockArgs {
        /// Lock name (an object may carry several named locks).
        pub name: String,
        /// Holder cookie, unique per acquisition.
        pub cookie: String,
        /// Holder description (client identity).
        pub owner: String,
        /// Exclusive or shared.
        pub exclusive: bool,
    }

    /// Arguments to `lock.unlock`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UnlockArgs {
        /// Lock name.
        pub name: String,
        /// Cookie used at acquisition.
        pub cookie: String,
        /// Owner used at acquisition.
        pub owner: String,
    }

    /// Arguments to `lock.get_info`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GetInfoArgs {
        /// Lock name.
        pub name: String,
    }

    /// One current holder of a lock.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LockHolder {
        /// Holder cookie.
        pub cookie: String,
        /// Holder description.
        pub owner: String,
    }

    /// Current state of a named lock.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LockInfo {
        /// Whether the lock is held exclusively.
        pub exclusive: bool,
        /// Current holders (one for exclusive, any number for shared).
        pub holders: Vec<LockHolder>,
    }

    fn xattr_name(lock_name: &str) -> String {
        format!("lock.{lock_name}")
    }

    fn load(data: &ObjectData, lock_name: &str) -> Result<Option<LockInfo>> {
        match data.xattrs.get(&xattr_name(lock_name)) {
            None => Ok(None),
            Some(raw) => bincode::deserialize(raw)
                .map(Some)
                .map_err(|e| cairn_core::Error::Encoding(e.to_string())),
        }
    }

    fn save(data: &mut ObjectData, lock_name: &str, info: &LockInfo) -> Result<()> {
        let raw = bincode::serialize(info).map_err(|e| cairn_core::Error::Encoding(e.to_string()))?;
        data.xattrs.insert(xattr_name(lock_name), raw);
        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(input: &[u8]) -> Result<T> {
        bincode::deserialize(input).map_err(|e| cairn_core::Error::Encoding(e.to_string()))
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| cairn_core::Error::Encoding(e.to_string()))
    }

    fn do_lock(data: &mut ObjectData, input: &[u8]) -> Result<Vec<u8>> {
        let args: LockArgs = decode(input)?;
        let mut info = load(data, &args.name)?.unwrap_or_default();
        let holder = LockHolder { cookie: args.cookie.clone(), owner: args.owner.clone() };

        if info.holders.contains(&holder) {
            return Err(Error::new(
                ErrorCode::Exists,
                format!("lock {} already held by this owner", args.name),
            ));
        }
        if !info.holders.is_empty() && (info.exclusive || args.exclusive) {
            return Err(Error::new(ErrorCode::Busy, format!("lock {} is held", args.name)));
        }

        info.exclusive = args.exclusive;
        info.holders.push(holder);
        save(data, &args.name, &info)?;
        Ok(Vec::new())
    }

    fn do_unlock(data: &mut ObjectData, input: &[u8]) -> Result<Vec<u8>> {
        let args: UnlockArgs = decode(input)?;
        let Some(mut info) = load(data, &args.name)? else {
            return Err(Error::not_found(format!("no such lock: {}", args.name)));
        };
        let before = info.holders.len();
        info.holders
            .retain(|h| !(h.cookie == args.cookie && h.owner == args.owner));
        if info.holders.len() == before {
            return Err(Error::not_found(format!("lock {} not held by this owner", args.name)));
        }
        if info.holders.is_empty() {
            data.xattrs.remove(&xattr_name(&args.name));
        } else {
            save(data, &args.name, &info)?;
        }
        Ok(Vec::new())
    }

    fn do_get_info(data: &mut ObjectData, input: &[u8]) -> Result<Vec<u8>> {
        let args: GetInfoArgs = decode(input)?;
        let info = load(data, &args.name)?.unwrap_or_default();
        encode(&info)
    }

    /// Registers the lock class in a registry.
    pub fn register(registry: &mut ClassRegistry) {
        registry.register(
            CLASS,
            LOCK,
            ClassMethodFlags { write: true, creates: true },
            Arc::new(do_lock),
        );
        registry.register(
            CLASS,
            UNLOCK,
            ClassMethodFlags { write: true, creates: false },
            Arc::new(do_unlock),
        );
        registry.register(
            CLASS,
            GET_INFO,
            ClassMethodFlags { write: false, creates: false },
            Arc::new(do_get_info),
        );
    }

    /// Encodes lock arguments for an `exec` call.
    pub fn encode_lock(args: &LockArgs) -> Result<Vec<u8>> {
        encode(args)
    }

    /// Encodes unlock arguments for an `exec` call.
    pub fn encode_unlock(args: &UnlockArgs) -> Result<Vec<u8>> {
        encode(args)
    }

    /// Encodes get-info arguments for an `exec` call.
    pub fn encode_get_info(args: &GetInfoArgs) -> Result<Vec<u8>> {
        encode(args)
    }

    /// Decodes the `get_info` reply.
    pub fn decode_info(reply: &[u8]) -> Result<LockInfo> {
        decode(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ClassRegistry::with_builtins();
        assert!(registry.get(lock::CLASS, lock::LOCK).is_ok());

        let err = registry.get("nope", "missing").err().unwrap();
        assert!(err.is(ErrorCode::NotSupported));
    }

    #[test]
    fn test_lock_exclusive_conflicts() {
        let mut data = ObjectData::default();

        let first = lock::encode_lock(&lock::LockArgs {
            name: "header".into(),
            cookie: "c1".into(),
            owner: "client.a".into(),
            exclusive: true,
        })
        .unwrap();
        let registry = ClassRegistry::with_builtins();
        let (_, body) = registry.get(lock::CLASS, lock::LOCK).unwrap();
        body(&mut data, &first).unwrap();

        // A second exclusive holder is refused.
        let second = lock::encode_lock(&lock::LockArgs {
            name: "header".into(),
            cookie: "c2".into(),
            owner: "client.b".into(),
            exclusive: true,
        })
        .unwrap();
        let err = body(&mut data, &second).unwrap_err();
        assert!(err.is(ErrorCode::Busy));

        // Re-locking by the same holder is Exists, not Busy.
        let err = body(&mut data, &first).unwrap_err();
        assert!(err.is(ErrorCode::Exists));
    }

    #[test]
    fn test_lock_shared_and_unlock() {
        let registry = ClassRegistry::with_builtins();
        let (_, lock_fn) = registry.get(lock::CLASS, lock::LOCK).unwrap();
        let (_, unlock_fn) = registry.get(lock::CLASS, lock::UNLOCK).unwrap();
        let (_, info_fn) = registry.get(lock::CLASS, lock::GET_INFO).unwrap();
        let mut data = ObjectData::default();

        for cookie in ["c1", "c2"] {
            let args = lock::encode_lock(&lock::LockArgs {
                name: "header".into(),
                cookie: cookie.into(),
                owner: "client.a".into(),
                exclusive: false,
            })
            .unwrap();
            lock_fn(&mut data, &args).unwrap();
        }

        let info_args = lock::encode_get_info(&lock::GetInfoArgs { name: "header".into() }).unwrap();
        let info = lock::decode_info(&info_fn(&mut data, &info_args).unwrap()).unwrap();
        assert_eq!(info.holders.len(), 2);
        assert!(!info.exclusive);

        let unlock = lock::encode_unlock(&lock::UnlockArgs {
            name: "header".into(),
            cookie: "c1".into(),
            owner: "client.a".into(),
        })
        .unwrap();
        unlock_fn(&mut data, &unlock).unwrap();

        // Unlocking twice is NotFound.
        let err = unlock_fn(&mut data, &unlock).unwrap_err();
        assert!(err.is(ErrorCode::NotFound));

        let info = lock::decode_info(&info_fn(&mut data, &info_args).unwrap()).unwrap();
        assert_eq!(info.holders.len(), 1);
    }

    #[test]
    fn test_unlock_missing_lock() {
        let registry = ClassRegistry::with_builtins();
        let (_, unlock_fn) = registry.get(lock::CLASS, lock::UNLOCK).unwrap();
        let mut data = ObjectData::default();

        let unlock = lock::encode_unlock(&lock::UnlockArgs {
            name: "header".into(),
            cookie: "c1".into(),
            owner: "client.a".into(),
        })
        .unwrap();
        assert!(unlock_fn(&mut data, &unlock).unwrap_err().is(ErrorCode::NotFound));
    }
}
