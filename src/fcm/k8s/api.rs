/*
 * Copyright (C) 2024 The FCM Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::meta::{LabelSelector, ObjectMeta};
use super::scheme::Scheme;
use super::store::{ResourceStore, StoreError};
use crate::fcm::util::names::generate_name;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const GENERATE_NAME_ATTEMPTS: usize = 5;

/// A typed, persisted record.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const API_VERSION: &'static str;
    const KIND: &'static str;
    type Status: Clone + Default + PartialEq + Send + Sync;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;
}

/// Typed view on a [`ResourceStore`] for one registered kind.
pub struct Api<R> {
    store: Arc<dyn ResourceStore>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for Api<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _marker: PhantomData,
        }
    }
}

impl<R: Resource> Api<R> {
    pub fn new(store: Arc<dyn ResourceStore>, scheme: &Scheme) -> Result<Self, StoreError> {
        if !scheme.is_registered::<R>() {
            return Err(StoreError::Invalid(format!(
                "kind {} ({}) is not registered",
                R::KIND,
                R::API_VERSION
            )));
        }
        Ok(Self {
            store,
            _marker: PhantomData,
        })
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<R, StoreError> {
        decode(self.store.get(R::KIND, namespace, name)?)
    }

    pub fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<R>, StoreError> {
        match self.get(namespace, name) {
            Ok(object) => Ok(Some(object)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn list(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<R>, StoreError> {
        self.store
            .list(R::KIND, namespace, selector)?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Creates the object. An empty name with `generate_name` set gets a
    /// random suffix, retried on collisions.
    pub fn create(&self, object: &R) -> Result<R, StoreError> {
        let prefix = object.metadata().generate_name.clone();
        match prefix {
            Some(prefix) if object.metadata().name.is_empty() => {
                let mut last_error = None;
                for _ in 0..GENERATE_NAME_ATTEMPTS {
                    let mut candidate = object.clone();
                    candidate.metadata_mut().name = generate_name(&prefix);
                    match self.store.create(R::KIND, encode(&candidate)?) {
                        Ok(created) => return decode(created),
                        Err(err) if err.is_already_exists() => last_error = Some(err),
                        Err(err) => return Err(err),
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    StoreError::Invalid(format!("could not generate a name for prefix {prefix}"))
                }))
            }
            _ => decode(self.store.create(R::KIND, encode(object)?)?),
        }
    }

    pub fn update(&self, object: &R) -> Result<R, StoreError> {
        decode(self.store.update(R::KIND, encode(object)?)?)
    }

    pub fn update_status(&self, object: &R) -> Result<R, StoreError> {
        decode(self.store.update_status(R::KIND, encode(object)?)?)
    }

    pub fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.store.delete(R::KIND, namespace, name)
    }
}

fn encode<R: Resource>(object: &R) -> Result<Value, StoreError> {
    let mut value =
        serde_json::to_value(object).map_err(|err| StoreError::Serialization(err.to_string()))?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("apiVersion".to_string(), Value::from(R::API_VERSION));
            map.insert("kind".to_string(), Value::from(R::KIND));
        }
        None => {
            return Err(StoreError::Invalid(format!(
                "{} did not serialize to a JSON map",
                R::KIND
            )))
        }
    }
    Ok(value)
}

fn decode<R: Resource>(value: Value) -> Result<R, StoreError> {
    serde_json::from_value(value)
        .map_err(|err| StoreError::Serialization(format!("decoding {}: {}", R::KIND, err)))
}

/// Runs `operation` until it stops failing with a conflict.
///
/// The closure must re-read the object it writes on every attempt. Waits grow
/// from `base` by doubling. Exhausting `attempts` turns the conflict into
/// [`StoreError::Unavailable`] so callers treat it as transient.
pub fn retry_on_conflict<T, F>(attempts: u32, base: Duration, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    let mut delay = base;
    loop {
        match operation() {
            Err(err) if err.is_conflict() && attempt < attempts => {
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) if err.is_conflict() => {
                return Err(StoreError::Unavailable(format!(
                    "giving up after {} conflicting writes: {}",
                    attempts, err
                )))
            }
            other => return other,
        }
    }
}
