// Library for event-driven network services built around channel pipelines.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Process-wide typed option and attribute keys, plus the per-channel
//! attribute map.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock};

use crate::channel::Channel;
use crate::Error;

/// Index-allocating name table. Entered only on key creation; lookups after
/// that use the allocated index.
struct KeyPool(OnceLock<Mutex<HashMap<&'static str, (usize, TypeId)>>>);

impl KeyPool {
    const fn new() -> Self { KeyPool(OnceLock::new()) }

    fn table(&self) -> &Mutex<HashMap<&'static str, (usize, TypeId)>> {
        self.0.get_or_init(|| Mutex::new(HashMap::new()))
    }

    /// Returns the index for `name`, allocating one on first use.
    ///
    /// # Panics
    ///
    /// Panics if the name is already registered with a different value type:
    /// two keys with the same name must be the same key.
    fn get_or_create<T: 'static>(&self, name: &'static str) -> usize {
        let mut table = self.table().lock().expect("key registry poisoned");
        let next = table.len() + 1;
        let (id, type_id) = *table.entry(name).or_insert((next, TypeId::of::<T>()));
        if type_id != TypeId::of::<T>() {
            panic!("key \"{name}\" is already registered with a different value type");
        }
        id
    }

    /// Allocates an index for a name which must not exist yet.
    fn create<T: 'static>(&self, name: &'static str) -> Result<usize, Error> {
        let mut table = self.table().lock().expect("key registry poisoned");
        if table.contains_key(name) {
            return Err(Error::DuplicateKey(name.to_owned()));
        }
        let id = table.len() + 1;
        table.insert(name, (id, TypeId::of::<T>()));
        Ok(id)
    }
}

static ATTR_KEYS: KeyPool = KeyPool::new();
static OPTION_KEYS: KeyPool = KeyPool::new();

/// Globally unique, typed key for per-channel attributes.
pub struct AttrKey<T> {
    id: usize,
    name: &'static str,
    _phantom: PhantomData<fn(T) -> T>,
}

impl<T> Clone for AttrKey<T> {
    fn clone(&self) -> Self { *self }
}
impl<T> Copy for AttrKey<T> {}

impl<T: 'static> AttrKey<T> {
    /// Returns the key registered under `name`, creating it on first use.
    /// Requesting an existing name yields the very same key.
    pub fn of(name: &'static str) -> Self {
        AttrKey {
            id: ATTR_KEYS.get_or_create::<T>(name),
            name,
            _phantom: PhantomData,
        }
    }

    /// Creates a key for a name which must not be registered yet.
    pub fn new(name: &'static str) -> Result<Self, Error> {
        Ok(AttrKey {
            id: ATTR_KEYS.create::<T>(name)?,
            name,
            _phantom: PhantomData,
        })
    }

    pub fn name(&self) -> &'static str { self.name }

    pub(crate) fn id(&self) -> usize { self.id }
}

impl<T> Debug for AttrKey<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "AttrKey({})", self.name) }
}

type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Globally unique, typed configuration option key carrying an optional value
/// validation predicate.
pub struct ChannelOption<T> {
    id: usize,
    name: &'static str,
    validator: Option<Validator<T>>,
}

impl<T> Clone for ChannelOption<T> {
    fn clone(&self) -> Self {
        ChannelOption {
            id: self.id,
            name: self.name,
            validator: self.validator.clone(),
        }
    }
}

impl<T: 'static> ChannelOption<T> {
    /// Returns the option registered under `name`, creating it on first use.
    pub fn of(name: &'static str) -> Self {
        ChannelOption {
            id: OPTION_KEYS.get_or_create::<T>(name),
            name,
            validator: None,
        }
    }

    /// Creates an option for a name which must not be registered yet.
    pub fn new(name: &'static str) -> Result<Self, Error> {
        Ok(ChannelOption {
            id: OPTION_KEYS.create::<T>(name)?,
            name,
            validator: None,
        })
    }

    /// Attaches a value validation predicate checked on every set.
    pub fn with_validator(mut self, validator: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &'static str { self.name }

    pub(crate) fn id(&self) -> usize { self.id }

    pub(crate) fn validate(&self, value: &T) -> bool {
        self.validator.as_ref().map_or(true, |validator| validator(value))
    }
}

impl<T> Debug for ChannelOption<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelOption({})", self.name)
    }
}

/// Typed attribute storage attached to every channel.
///
/// Key-level updates are safe from any thread.
#[derive(Default)]
pub struct AttributeMap {
    map: Mutex<HashMap<usize, Box<dyn Any + Send + Sync>>>,
}

impl AttributeMap {
    pub fn new() -> Self { AttributeMap { map: empty!() } }

    pub fn set<T: Send + Sync + 'static>(&self, key: AttrKey<T>, value: T) {
        self.map.lock().expect("attribute map poisoned").insert(key.id(), Box::new(value));
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: AttrKey<T>) -> Option<T> {
        self.map
            .lock()
            .expect("attribute map poisoned")
            .get(&key.id())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: 'static>(&self, key: AttrKey<T>) -> bool {
        self.map.lock().expect("attribute map poisoned").contains_key(&key.id())
    }

    pub fn remove<T: 'static>(&self, key: AttrKey<T>) -> bool {
        self.map.lock().expect("attribute map poisoned").remove(&key.id()).is_some()
    }
}

type Applier = Arc<dyn Fn(&Channel) -> bool + Send + Sync>;

#[derive(Clone)]
struct ValueEntry {
    id: usize,
    name: &'static str,
    apply: Applier,
}

/// Insertion-ordered set of option values collected by a bootstrap and applied
/// to channels as they are created.
///
/// The order is kept because later options may validate against earlier ones;
/// setting an already present option replaces its value in place, setting
/// `None` removes it.
#[derive(Clone, Default)]
pub struct OptionValues {
    entries: Vec<ValueEntry>,
}

impl OptionValues {
    pub fn new() -> Self { OptionValues { entries: vec![] } }

    pub fn set<T>(&mut self, option: ChannelOption<T>, value: Option<T>) -> Result<(), Error>
    where T: Clone + Send + Sync + 'static {
        let Some(value) = value else {
            self.entries.retain(|entry| entry.id != option.id());
            return Ok(());
        };
        if !option.validate(&value) {
            return Err(Error::InvalidOption(option.name()));
        }
        let id = option.id();
        let name = option.name();
        let apply: Applier =
            Arc::new(move |channel| channel.config().set_option(&option, value.clone()));
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => entry.apply = apply,
            None => self.entries.push(ValueEntry { id, name, apply }),
        }
        Ok(())
    }

    /// Applies every value in insertion order; options the channel does not
    /// support are skipped with a warning.
    pub fn apply(&self, channel: &Channel) {
        for entry in &self.entries {
            if !(entry.apply)(channel) {
                #[cfg(feature = "log")]
                log::warn!(target: "bootstrap",
                    "Unknown or invalid option {} for {channel:?}; skipping", entry.name);
            }
        }
    }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Insertion-ordered set of attribute values collected by a bootstrap.
#[derive(Clone, Default)]
pub struct AttrValues {
    entries: Vec<ValueEntry>,
}

impl AttrValues {
    pub fn new() -> Self { AttrValues { entries: vec![] } }

    pub fn set<T>(&mut self, key: AttrKey<T>, value: Option<T>)
    where T: Clone + Send + Sync + 'static {
        let Some(value) = value else {
            self.entries.retain(|entry| entry.id != key.id());
            return;
        };
        let apply: Applier = Arc::new(move |channel| {
            channel.attrs().set(key, value.clone());
            true
        });
        match self.entries.iter_mut().find(|entry| entry.id == key.id()) {
            Some(entry) => entry.apply = apply,
            None => self.entries.push(ValueEntry {
                id: key.id(),
                name: key.name(),
                apply,
            }),
        }
    }

    pub fn apply(&self, channel: &Channel) {
        for entry in &self.entries {
            (entry.apply)(channel);
        }
    }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_name_is_same_key() {
        let a = AttrKey::<u32>::of("test.same-name");
        let b = AttrKey::<u32>::of("test.same-name");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn explicit_creation_rejects_duplicates() {
        AttrKey::<u32>::new("test.created-once").unwrap();
        let err = AttrKey::<u32>::new("test.created-once").unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(name) if name == "test.created-once"));
    }

    #[test]
    #[should_panic(expected = "different value type")]
    fn type_mismatch_is_rejected() {
        AttrKey::<u32>::of("test.typed");
        AttrKey::<String>::of("test.typed");
    }

    #[test]
    fn attribute_map_roundtrip() {
        let key = AttrKey::<String>::of("test.roundtrip");
        let map = AttributeMap::new();
        assert!(map.get(key).is_none());
        map.set(key, "value".to_owned());
        assert_eq!(map.get(key).as_deref(), Some("value"));
        assert!(map.remove(key));
        assert!(!map.contains(key));
    }

    #[test]
    fn option_validator_rejects_on_set() {
        let option = ChannelOption::<usize>::of("test.positive").with_validator(|v| *v > 0);
        let mut values = OptionValues::new();
        assert!(matches!(
            values.set(option.clone(), Some(0)),
            Err(Error::InvalidOption("test.positive"))
        ));
        values.set(option.clone(), Some(16)).unwrap();
        assert!(!values.is_empty());
        values.set(option, None).unwrap();
        assert!(values.is_empty());
    }
}
