// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer-side type registry.
//!
//! Types are declared with [`TypeDescriptor`] and its builder, collected in
//! a process-private [`TypeRegistry`], and flushed into the header's type
//! and field tables where observers discover them.
//!
//! Ids are assigned by hashing the canonical type name into the user-type
//! id space, with linear probing on collision, so the same type name maps
//! to the same id across producer runs. A `TypeId` alias table lets generic
//! `create::<T>` resolve the numeric id from the Rust type.

use crate::layout::{
    Atomicity, FieldEntry, Primitive, SessionHeader, TypeEntry, FIELD_IS_ARRAY, FIELD_IS_NESTED,
    FIELD_READ_ONLY, USER_TYPE_BASE,
};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

/// Declarative description of one field of an observed type.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    /// Byte offset within the containing type (`std::mem::offset_of!`)
    pub offset: u32,
    /// Byte size of the field (whole array for array fields)
    pub size: u32,
    /// Primitive id, or the registered user type id for nested fields
    pub type_id: u32,
    /// Element count for array fields, 0 otherwise
    pub array_len: u32,
    pub atomicity: Atomicity,
    pub nested: bool,
    pub read_only: bool,
}

impl FieldDescriptor {
    fn wire_flags(&self) -> u32 {
        let mut flags = 0;
        if self.array_len > 0 {
            flags |= FIELD_IS_ARRAY;
        }
        if self.nested {
            flags |= FIELD_IS_NESTED;
        }
        if self.read_only {
            flags |= FIELD_READ_ONLY;
        }
        flags
    }
}

/// Declarative description of an observed type.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub size: u32,
    pub alignment: u32,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    /// Start a builder capturing `T`'s size and alignment.
    #[must_use]
    pub fn builder<T>(name: impl Into<String>) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            name: name.into(),
            size: std::mem::size_of::<T>() as u32,
            alignment: std::mem::align_of::<T>() as u32,
            fields: Vec::new(),
        }
    }
}

/// Fluent builder for [`TypeDescriptor`].
///
/// Offsets come from `std::mem::offset_of!` at the call site; sizes are
/// derived from the declared primitive / element count.
#[derive(Debug)]
pub struct TypeDescriptorBuilder {
    name: String,
    size: u32,
    alignment: u32,
    fields: Vec<FieldDescriptor>,
}

impl TypeDescriptorBuilder {
    /// Add a scalar field.
    #[must_use]
    pub fn field(
        mut self,
        name: impl Into<String>,
        offset: usize,
        primitive: Primitive,
        atomicity: Atomicity,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            offset: offset as u32,
            size: primitive.size(),
            type_id: primitive as u32,
            array_len: 0,
            atomicity,
            nested: false,
            read_only: false,
        });
        self
    }

    /// Add a fixed-length array field of a primitive element type.
    #[must_use]
    pub fn array_field(
        mut self,
        name: impl Into<String>,
        offset: usize,
        element: Primitive,
        len: usize,
        atomicity: Atomicity,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            offset: offset as u32,
            size: element.size() * len as u32,
            type_id: element as u32,
            array_len: len as u32,
            atomicity,
            nested: false,
            read_only: false,
        });
        self
    }

    /// Add a field whose value is an instance of a registered user type.
    ///
    /// For a `Guarded<U>`/`Locked<U>` wrapper field, pass the *wrapper*
    /// offset and size with the matching atomicity; observers locate the
    /// payload through the wrapper's fixed layout.
    #[must_use]
    pub fn nested_field(
        mut self,
        name: impl Into<String>,
        offset: usize,
        size: usize,
        user_type_id: u32,
        atomicity: Atomicity,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            offset: offset as u32,
            size: size as u32,
            type_id: user_type_id,
            array_len: 0,
            atomicity,
            nested: true,
            read_only: false,
        });
        self
    }

    /// Mark the most recently added field read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        if let Some(last) = self.fields.last_mut() {
            last.read_only = true;
        }
        self
    }

    #[must_use]
    pub fn build(self) -> TypeDescriptor {
        TypeDescriptor {
            name: self.name,
            size: self.size,
            alignment: self.alignment,
            fields: self.fields,
        }
    }
}

/// djb2, folded into the user-type id space.
fn hash_type_name(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    hash | USER_TYPE_BASE
}

/// Process-private registry of declared types, in registration order.
#[derive(Default)]
pub(crate) struct TypeRegistry {
    types: Vec<(u32, TypeDescriptor)>,
    name_to_id: HashMap<String, u32>,
    alias_to_id: HashMap<TypeId, u32>,
}

impl TypeRegistry {
    /// Register a descriptor; re-registering the same name returns the
    /// existing id.
    pub(crate) fn register(&mut self, desc: TypeDescriptor) -> u32 {
        if let Some(&id) = self.name_to_id.get(&desc.name) {
            return id;
        }

        // Probe past ids taken by concurrently registered names.
        let mut type_id = hash_type_name(&desc.name);
        while self.types.iter().any(|(id, _)| *id == type_id) {
            type_id = type_id.wrapping_add(1) | USER_TYPE_BASE;
        }

        self.name_to_id.insert(desc.name.clone(), type_id);
        self.types.push((type_id, desc));
        type_id
    }

    /// Register and alias the Rust type so `create::<T>` can find the id.
    pub(crate) fn register_for(&mut self, alias: TypeId, desc: TypeDescriptor) -> u32 {
        let id = self.register(desc);
        self.alias_to_id.insert(alias, id);
        id
    }

    /// Remove a type that failed to publish, restoring the registry to its
    /// pre-registration state so the name and alias resolve to nothing.
    pub(crate) fn unregister(&mut self, name: &str, alias: Option<TypeId>) {
        if let Some(id) = self.name_to_id.remove(name) {
            self.types.retain(|(type_id, _)| *type_id != id);
        }
        if let Some(alias) = alias {
            self.alias_to_id.remove(&alias);
        }
    }

    pub(crate) fn id_for_name(&self, name: &str) -> Option<u32> {
        self.name_to_id.get(name).copied()
    }

    pub(crate) fn id_for_alias(&self, alias: TypeId) -> Option<u32> {
        self.alias_to_id.get(&alias).copied()
    }

    pub(crate) fn descriptor(&self, type_id: u32) -> Option<&TypeDescriptor> {
        self.types
            .iter()
            .find(|(id, _)| *id == type_id)
            .map(|(_, d)| d)
    }

    pub(crate) fn len(&self) -> usize {
        self.types.len()
    }

    /// Copy the registry into the header's type and field tables and
    /// publish the new counts.
    ///
    /// Entries are written in registration order; each type's
    /// `fields_offset` points at its first entry in the field table. Types
    /// or fields past the configured capacities are silently left
    /// unpublished.
    ///
    /// # Safety
    ///
    /// `base` must be the base of the live header region that `header`
    /// points into, with the table extents recorded in the header.
    pub(crate) unsafe fn write_to_header(&self, header: &SessionHeader, base: *mut u8) {
        let type_table = base.add(header.type_table_offset as usize).cast::<TypeEntry>();
        let field_table = base
            .add(header.field_table_offset as usize)
            .cast::<FieldEntry>();

        let mut type_count: u32 = 0;
        let mut field_count: u32 = 0;

        for (type_id, desc) in &self.types {
            if type_count >= header.type_capacity {
                log::warn!("[REGISTRY] type table full, {} not published", desc.name);
                break;
            }
            if field_count as usize + desc.fields.len() > header.field_capacity as usize {
                log::warn!("[REGISTRY] field table full, {} not published", desc.name);
                break;
            }

            let entry = &mut *type_table.add(type_count as usize);
            entry.type_id = *type_id;
            entry.size = desc.size;
            entry.alignment = desc.alignment;
            entry.field_count = desc.fields.len() as u32;
            entry.fields_offset = header.field_table_offset
                + u64::from(field_count) * std::mem::size_of::<FieldEntry>() as u64;
            entry.set_name(&desc.name);

            for field_desc in &desc.fields {
                let field = &mut *field_table.add(field_count as usize);
                field.offset = field_desc.offset;
                field.size = field_desc.size;
                field.type_id = field_desc.type_id;
                field.flags = field_desc.wire_flags();
                field.array_len = field_desc.array_len;
                field.atomicity = field_desc.atomicity as u8;
                field.set_name(&field_desc.name);
                field_count += 1;
            }

            type_count += 1;
        }

        header.type_count.store(type_count, Ordering::Release);
        header.field_count.store(field_count, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct Telemetry {
        frame: u64,
        cpu_load: f32,
        flags: [u8; 8],
    }

    fn telemetry_descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Telemetry>("Telemetry")
            .field(
                "frame",
                offset_of!(Telemetry, frame),
                Primitive::UInt64,
                Atomicity::Atomic,
            )
            .field(
                "cpu_load",
                offset_of!(Telemetry, cpu_load),
                Primitive::Float32,
                Atomicity::None,
            )
            .array_field(
                "flags",
                offset_of!(Telemetry, flags),
                Primitive::UInt8,
                8,
                Atomicity::None,
            )
            .build()
    }

    #[test]
    fn builder_captures_layout() {
        let desc = telemetry_descriptor();
        assert_eq!(desc.size, std::mem::size_of::<Telemetry>() as u32);
        assert_eq!(desc.alignment, 8);
        assert_eq!(desc.fields.len(), 3);
        assert_eq!(desc.fields[0].size, 8);
        assert_eq!(desc.fields[2].size, 8);
        assert_eq!(desc.fields[2].array_len, 8);
        assert_eq!(desc.fields[2].wire_flags(), FIELD_IS_ARRAY);
    }

    #[test]
    fn ids_are_stable_and_in_user_space() {
        let mut reg = TypeRegistry::default();
        let id1 = reg.register(telemetry_descriptor());
        let id2 = reg.register(telemetry_descriptor());
        assert_eq!(id1, id2);
        assert!(id1 >= USER_TYPE_BASE);
        assert_eq!(reg.len(), 1);
        assert_eq!(hash_type_name("Telemetry"), id1);
    }

    #[test]
    fn colliding_hashes_probe_to_distinct_ids() {
        let mut reg = TypeRegistry::default();
        let id1 = reg.register(telemetry_descriptor());

        // Force a collision by pre-claiming the would-be id of a second name.
        let mut clone = telemetry_descriptor();
        clone.name = "Telemetry2".to_string();
        let forced = hash_type_name("Telemetry2");
        reg.types.push((forced, telemetry_descriptor()));

        let id2 = reg.register(clone);
        assert_ne!(id2, forced);
        assert_ne!(id2, id1);
        assert!(id2 >= USER_TYPE_BASE);
    }

    #[test]
    fn unregister_restores_pre_registration_state() {
        let mut reg = TypeRegistry::default();
        let keep = reg.register(telemetry_descriptor());

        let mut doomed = telemetry_descriptor();
        doomed.name = "Doomed".to_string();
        let id = reg.register_for(TypeId::of::<u64>(), doomed);

        reg.unregister("Doomed", Some(TypeId::of::<u64>()));
        assert_eq!(reg.len(), 1);
        assert!(reg.id_for_name("Doomed").is_none());
        assert!(reg.id_for_alias(TypeId::of::<u64>()).is_none());
        assert!(reg.descriptor(id).is_none());
        assert_eq!(reg.id_for_name("Telemetry"), Some(keep));
    }

    #[test]
    fn alias_resolves_rust_type() {
        let mut reg = TypeRegistry::default();
        let id = reg.register_for(TypeId::of::<Telemetry>(), telemetry_descriptor());
        assert_eq!(reg.id_for_alias(TypeId::of::<Telemetry>()), Some(id));
        assert_eq!(reg.id_for_name("Telemetry"), Some(id));
        assert!(reg.id_for_alias(TypeId::of::<u32>()).is_none());
        assert!(reg.descriptor(id).is_some());
    }
}
