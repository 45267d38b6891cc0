//! Property-based tests for negotiation, SVM ordering and queue accounting.
//!
//! - **Negotiation** records `pairs * pair_size + terminator` bytes for every
//!   accepted list and rejects any list containing an unknown name.
//! - **Ordering**: a fine-grained-system incapable device is always first
//!   in allocation order when one exists.
//! - **Queues**: `can_add_queue` flips exactly at the device limit.

use std::sync::Arc;

use clrt_context::mock::MockDevice;
use clrt_context::properties::{PROPERTY_PAIR_SIZE, PROPERTY_TABLE, PROPERTY_TERMINATOR_SIZE};
use clrt_context::{
    ContextBuilder, ContextError, DeviceQueueRegistry, DeviceRef, PlatformId, PropertyList,
    PropertyName, PropertyNegotiator, QueueId, SvmCapabilities, SvmMemFlags,
};
use proptest::prelude::*;

const PLATFORM: PlatformId = PlatformId::new(0x77AA);

// ── Strategies ───────────────────────────────────────────────────────────────

fn user_sync(on: bool) -> (PropertyName, isize) {
    (PropertyName::InteropUserSync, isize::from(on))
}

fn arb_handle() -> impl Strategy<Value = isize> {
    1_isize..=isize::MAX
}

/// A property that is valid on every platform and needs no interop.
fn arb_plain_pair() -> BoxedStrategy<(PropertyName, isize)> {
    prop_oneof![
        Just((PropertyName::Platform, PLATFORM.as_raw())),
        Just((PropertyName::Platform, 0)),
        any::<bool>().prop_map(user_sync),
        Just((PropertyName::OfflineDevices, 1)),
    ]
    .boxed()
}

/// Any property valid on every platform, graphics handles included.
fn arb_valid_pair() -> BoxedStrategy<(PropertyName, isize)> {
    prop_oneof![
        arb_plain_pair(),
        arb_handle().prop_map(|h| (PropertyName::GlContext, h)),
        arb_handle().prop_map(|h| (PropertyName::EglDisplay, h)),
    ]
    .boxed()
}

fn arb_valid_list() -> impl Strategy<Value = PropertyList> {
    list_of(arb_valid_pair())
}

fn arb_plain_list() -> impl Strategy<Value = PropertyList> {
    list_of(arb_plain_pair())
}

/// Each property kind at most once.
fn list_of(pair: BoxedStrategy<(PropertyName, isize)>) -> impl Strategy<Value = PropertyList> {
    prop::collection::vec(pair, 0..8).prop_map(first_of_each)
}

fn first_of_each(pairs: Vec<(PropertyName, isize)>) -> PropertyList {
    let mut seen = Vec::new();
    let mut list = PropertyList::new();
    for (name, value) in pairs {
        if !seen.contains(&name) {
            seen.push(name);
            list = list.with(name, value);
        }
    }
    list
}

/// A raw name that is not in the lookup table and is not the terminator.
fn arb_unknown_name() -> impl Strategy<Value = isize> {
    any::<isize>()
        .prop_filter("must be unknown and non-zero", is_unknown_name)
}

fn is_unknown_name(name: &isize) -> bool {
    *name != 0 && PROPERTY_TABLE.iter().all(|(code, _)| code != name)
}

fn arb_svm_caps() -> impl Strategy<Value = SvmCapabilities> {
    prop::sample::select(vec![
        SvmCapabilities::empty(),
        SvmCapabilities::COARSE_GRAIN_BUFFER,
        SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::FINE_GRAIN_BUFFER,
        SvmCapabilities::COARSE_GRAIN_BUFFER
            | SvmCapabilities::FINE_GRAIN_BUFFER
            | SvmCapabilities::FINE_GRAIN_SYSTEM,
        SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::ATOMICS,
    ])
}

fn arb_caps_list() -> impl Strategy<Value = Vec<SvmCapabilities>> {
    prop::collection::vec(arb_svm_caps(), 0..6)
}

// ── Negotiation ──────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn valid_lists_record_exact_byte_size(list in arb_valid_list()) {
        let info = PropertyNegotiator::new(PLATFORM).negotiate(Some(&list)).unwrap();
        prop_assert_eq!(
            info.properties_size,
            list.len() * PROPERTY_PAIR_SIZE + PROPERTY_TERMINATOR_SIZE
        );
        prop_assert_eq!(info.properties_size, list.byte_size());
        prop_assert!(info.is_consistent());
    }

    #[test]
    fn unknown_name_anywhere_is_rejected(
        list in arb_valid_list(),
        unknown in arb_unknown_name(),
        value in any::<isize>(),
        at in any::<prop::sample::Index>(),
    ) {
        let mut raw = list.to_raw();
        let pairs = list.len();
        let slot = at.index(pairs + 1) * 2;
        raw.splice(slot..slot, [unknown, value]);

        let result = PropertyNegotiator::new(PLATFORM).negotiate_raw(Some(&raw));
        let is_invalid_value = matches!(result, Err(ContextError::InvalidValue { .. }));
        prop_assert!(is_invalid_value);
    }

    #[test]
    fn created_context_copies_list_verbatim(list in arb_plain_list()) {
        let raw = list.to_raw();
        let ctx = ContextBuilder::new(PLATFORM).create(Some(&raw)).unwrap();
        prop_assert_eq!(ctx.properties(), Some(raw.as_slice()));
    }
}

// ── SVM ordering ─────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn incapable_device_leads_allocation_order(caps in arb_caps_list()) {
        let devices: Vec<Arc<MockDevice>> = caps
            .iter()
            .enumerate()
            .map(|(i, c)| MockDevice::builder(&format!("d{i}")).svm(*c).build_arc())
            .collect();
        let ctx = ContextBuilder::new(PLATFORM)
            .devices(devices.iter().cloned().map(DeviceRef::from))
            .create(None)
            .unwrap();

        let order = ctx.svm_devices();
        prop_assert_eq!(order.len(), caps.iter().filter(|c| !c.is_empty()).count());
        if order.iter().any(|d| !d.is_fine_grained_system()) {
            prop_assert!(!order[0].is_fine_grained_system());
        }

        if order.is_empty() {
            prop_assert!(ctx.svm_alloc(4096, 256, SvmMemFlags::READ_WRITE, None).is_none());
        }
    }
}

// ── Queue accounting ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn can_add_flips_at_limit(max in 0_u32..16) {
        let gpu = MockDevice::builder("gpu").max_on_device_queues(max);
        let dev = DeviceRef::from(gpu.build_arc());
        let mut reg = DeviceQueueRegistry::new();
        for i in 0..max {
            prop_assert!(reg.can_add_queue(&dev));
            reg.add(&dev, QueueId(u64::from(i)), i == 0);
        }
        prop_assert!(!reg.can_add_queue(&dev));
    }
}
