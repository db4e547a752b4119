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

//! Revision numbers order the set generations of a deployment. They live in
//! an annotation and are never used for anything but ordering.

use crate::fcm::controller::reconcile::ReconcileError;
use crate::fcm::k8s::firewall::ANNOTATION_REVISION;
use crate::fcm::k8s::Resource;

/// Revision of `object`; a missing annotation counts as 0.
pub fn revision<R: Resource>(object: &R) -> Result<i64, ReconcileError> {
    let Some(raw) = object.metadata().annotation(ANNOTATION_REVISION) else {
        return Ok(0);
    };
    match raw.trim().parse::<i64>() {
        Ok(value) if value >= 0 => Ok(value),
        _ => Err(ReconcileError::Validation(format!(
            "{} {} has malformed revision annotation {:?}",
            R::KIND,
            object.metadata().key(),
            raw
        ))),
    }
}

pub fn set_revision<R: Resource>(object: &mut R, revision: i64) {
    object
        .metadata_mut()
        .annotations
        .insert(ANNOTATION_REVISION.to_string(), revision.to_string());
}

/// Element with the highest revision; ties keep the first one seen.
pub fn max_revision_of<R: Resource>(objects: &[R]) -> Result<Option<&R>, ReconcileError> {
    pick_revision(objects, |candidate, best| candidate > best)
}

/// Element with the lowest revision; ties keep the first one seen.
pub fn min_revision_of<R: Resource>(objects: &[R]) -> Result<Option<&R>, ReconcileError> {
    pick_revision(objects, |candidate, best| candidate < best)
}

fn pick_revision<R: Resource>(
    objects: &[R],
    better: impl Fn(i64, i64) -> bool,
) -> Result<Option<&R>, ReconcileError> {
    let mut best: Option<(&R, i64)> = None;
    for object in objects {
        let value = revision(object)?;
        match best {
            Some((_, current)) if !better(value, current) => {}
            _ => best = Some((object, value)),
        }
    }
    Ok(best.map(|(object, _)| object))
}

/// `objects` without the excluded ones, compared by uid, or by namespace and
/// name for objects not yet persisted.
pub fn except<R: Resource>(objects: &[R], excluded: &[&R]) -> Vec<R> {
    objects
        .iter()
        .filter(|object| !excluded.iter().any(|other| same_object(*object, *other)))
        .cloned()
        .collect()
}

pub fn same_object<R: Resource>(a: &R, b: &R) -> bool {
    let (a, b) = (a.metadata(), b.metadata());
    match (a.uid.as_deref(), b.uid.as_deref()) {
        (Some(left), Some(right)) => left == right,
        _ => a.namespace == b.namespace && a.name == b.name,
    }
}
