//! Integration tests for buffer mapping through the shadow shim.
//!
//! Narrow callers cannot hold any driver address, so every mapping they make
//! is served from a shadow buffer. Native callers get the driver's pointer.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use rstest::rstest;

use common::{Caller, TestWgl, ARRAY_BUFFER, DC, ELEMENT_ARRAY_BUFFER};
use redlilium_wgl::{
    BufferKey, Driver, DriverError, DummyDriver, MapAccess, MapRequest, MappedPtr, Wgl,
    WglError, WglParameters,
};

fn read(ptr: MappedPtr, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec()
}

fn fill(ptr: MappedPtr, len: usize, value: u8) {
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), value, len) };
}

// ============================================================================
// Round Trips
// ============================================================================

#[rstest]
#[case::native(Caller::Native)]
#[case::narrow(Caller::Narrow)]
fn test_map_reads_buffer_contents(#[case] caller: Caller) {
    let t = TestWgl::new(caller);
    t.bound_context();
    let key = t.create_pattern_buffer(ARRAY_BUFFER, 100);

    let ptr = t
        .wgl
        .map_buffer(&MapRequest::whole(key, MapAccess::READ))
        .unwrap();
    assert_eq!(read(ptr, 100), (0..100).map(|i| i as u8).collect::<Vec<_>>());

    let expected_shadows = match caller {
        Caller::Native => 0,
        Caller::Narrow => 1,
    };
    assert_eq!(t.wgl.shadow_count(), expected_shadows);

    t.wgl.unmap_buffer(key).unwrap();
    assert_eq!(t.wgl.shadow_count(), 0);
    assert!(!t.driver.is_mapped(key));
}

#[rstest]
#[case::native(Caller::Native)]
#[case::narrow(Caller::Narrow)]
fn test_writes_reach_driver_on_unmap(#[case] caller: Caller) {
    let t = TestWgl::new(caller);
    t.bound_context();
    let key = t.create_buffer(ARRAY_BUFFER, 64, 0);

    let ptr = t
        .wgl
        .map_buffer(&MapRequest::whole(key, MapAccess::READ | MapAccess::WRITE))
        .unwrap();
    fill(ptr, 64, 0xab);
    t.wgl.unmap_buffer(key).unwrap();

    assert_eq!(t.driver.buffer_contents(key).unwrap(), vec![0xab; 64]);
}

#[rstest]
#[case::native(Caller::Native)]
#[case::narrow(Caller::Narrow)]
fn test_range_mapping(#[case] caller: Caller) {
    let t = TestWgl::new(caller);
    t.bound_context();
    let key = t.create_pattern_buffer(ARRAY_BUFFER, 256);

    let ptr = t
        .wgl
        .map_buffer(&MapRequest::range(key, 32, 8, MapAccess::READ | MapAccess::WRITE))
        .unwrap();
    assert_eq!(read(ptr, 8), (32..40).collect::<Vec<u8>>());
    fill(ptr, 8, 0xff);
    t.wgl.unmap_buffer(key).unwrap();

    let contents = t.driver.buffer_contents(key).unwrap();
    assert_eq!(&contents[32..40], &[0xff; 8]);
    assert_eq!(contents[31], 31);
    assert_eq!(contents[40], 40);
}

// ============================================================================
// Shadow Buffers
// ============================================================================

#[rstest]
#[case(1)]
#[case(15)]
#[case(16)]
#[case(17)]
#[case(4099)]
fn test_shadow_is_aligned_and_large_enough(#[case] len: usize) {
    let t = TestWgl::new(Caller::Narrow);
    t.bound_context();
    let key = t.create_buffer(ARRAY_BUFFER, len, 0x5a);

    let ptr = t
        .wgl
        .map_buffer(&MapRequest::whole(key, MapAccess::READ))
        .unwrap();
    assert_eq!(ptr.addr() % 16, 0);
    assert_eq!(read(ptr, len), vec![0x5a; len]);
    t.wgl.unmap_buffer(key).unwrap();
}

#[test]
fn test_concurrent_mappings_get_distinct_shadows() {
    let t = TestWgl::new(Caller::Narrow);
    t.bound_context();
    let vertices = t.create_buffer(ARRAY_BUFFER, 48, 1);
    let indices = t.create_buffer(ELEMENT_ARRAY_BUFFER, 48, 2);

    let a = t
        .wgl
        .map_buffer(&MapRequest::whole(vertices, MapAccess::WRITE))
        .unwrap();
    let b = t
        .wgl
        .map_buffer(&MapRequest::whole(indices, MapAccess::WRITE))
        .unwrap();
    assert_ne!(a, b);
    assert!(a.addr() + 48 <= b.addr() || b.addr() + 48 <= a.addr());
    assert_eq!(t.wgl.shadow_count(), 2);

    fill(a, 48, 3);
    fill(b, 48, 4);
    t.wgl.unmap_buffer(indices).unwrap();
    assert_eq!(t.wgl.shadow_count(), 1);
    t.wgl.unmap_buffer(vertices).unwrap();
    assert_eq!(t.wgl.shadow_count(), 0);

    assert_eq!(t.driver.buffer_contents(vertices).unwrap(), vec![3; 48]);
    assert_eq!(t.driver.buffer_contents(indices).unwrap(), vec![4; 48]);
}

#[test]
fn test_threads_map_same_target_in_their_own_contexts() {
    let t = TestWgl::new(Caller::Narrow);
    let key = BufferKey::Target(ARRAY_BUFFER);
    let contexts = [t.create_context(), t.create_context()];
    for &context in &contexts {
        let ctx = t.wgl.driver_context(context).unwrap();
        t.driver.create_context_buffer(ctx, key, &[0xaa; 8]);
    }

    // Both mappings overlap: first maps, second maps, first unmaps, second unmaps.
    let barrier = Barrier::new(2);
    let results = thread::scope(|s| {
        let workers: Vec<_> = contexts
            .iter()
            .zip([0x11u8, 0x22])
            .enumerate()
            .map(|(i, (&context, value))| {
                let (t, barrier) = (&t, &barrier);
                s.spawn(move || {
                    t.wgl.make_current(Some(DC), Some(context)).unwrap();
                    let request = MapRequest::whole(key, MapAccess::READ | MapAccess::WRITE);
                    let mut result = Ok(());
                    for phase in 0..4 {
                        if phase == i {
                            result = t.wgl.map_buffer(&request).map(|ptr| fill(ptr, 8, value));
                        }
                        if phase == i + 2 && result.is_ok() {
                            result = t.wgl.unmap_buffer(key);
                        }
                        barrier.wait();
                    }
                    t.wgl.make_current(None, None).unwrap();
                    result
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(results, vec![Ok(()), Ok(())]);
    for (context, value) in contexts.into_iter().zip([0x11u8, 0x22]) {
        let ctx = t.wgl.driver_context(context).unwrap();
        assert_eq!(
            t.driver.context_buffer_contents(ctx, key).unwrap(),
            vec![value; 8]
        );
    }
}

#[test]
fn test_invalidating_map_skips_copy_in() {
    let t = TestWgl::new(Caller::Narrow);
    t.bound_context();
    let key = t.create_buffer(ARRAY_BUFFER, 32, 9);

    let ptr = t
        .wgl
        .map_buffer(&MapRequest::whole(
            key,
            MapAccess::WRITE | MapAccess::INVALIDATE_BUFFER,
        ))
        .unwrap();
    assert_eq!(read(ptr, 32), vec![0; 32]);
    t.wgl.unmap_buffer(key).unwrap();
    assert_eq!(t.driver.buffer_contents(key).unwrap(), vec![0; 32]);
}

#[test]
fn test_read_only_map_does_not_write_back() {
    let t = TestWgl::new(Caller::Narrow);
    t.bound_context();
    let key = t.create_buffer(ARRAY_BUFFER, 16, 7);

    let ptr = t
        .wgl
        .map_buffer(&MapRequest::whole(key, MapAccess::READ))
        .unwrap();
    fill(ptr, 16, 0);
    t.wgl.unmap_buffer(key).unwrap();
    assert_eq!(t.driver.buffer_contents(key).unwrap(), vec![7; 16]);
}

#[test]
fn test_driver_reported_unrepresentable_mapping() {
    common::init_logger();
    let driver = Arc::new(DummyDriver::new().with_unrepresentable_mappings());
    let wgl = Wgl::new(WglParameters::default());
    wgl.register_surface(DC, Arc::clone(&driver) as Arc<dyn Driver>);
    let context = wgl.create_context(DC).unwrap();
    wgl.make_current(Some(DC), Some(context)).unwrap();

    let key = BufferKey::Named(5);
    driver.create_buffer(key, &[1, 2, 3, 4, 5]);
    let ptr = wgl
        .map_buffer(&MapRequest::whole(key, MapAccess::READ | MapAccess::WRITE))
        .unwrap();
    assert_eq!(ptr.addr() % 16, 0);
    assert_eq!(read(ptr, 5), vec![1, 2, 3, 4, 5]);
    fill(ptr, 5, 6);
    wgl.unmap_buffer(key).unwrap();

    assert_eq!(driver.buffer_contents(key).unwrap(), vec![6; 5]);
    assert_eq!(wgl.shadow_count(), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[rstest]
#[case::native(Caller::Native)]
#[case::narrow(Caller::Narrow)]
fn test_failed_map_leaves_no_shadow(#[case] caller: Caller) {
    let t = TestWgl::new(caller);
    t.bound_context();
    let missing = BufferKey::Target(ARRAY_BUFFER);

    assert!(matches!(
        t.wgl.map_buffer(&MapRequest::whole(missing, MapAccess::READ)),
        Err(WglError::DriverFailure(_))
    ));
    assert_eq!(t.wgl.shadow_count(), 0);

    let key = t.create_buffer(ARRAY_BUFFER, 8, 0);
    assert!(t
        .wgl
        .map_buffer(&MapRequest::range(key, 4, 16, MapAccess::READ))
        .is_err());
    assert_eq!(t.wgl.shadow_count(), 0);
    assert!(!t.driver.is_mapped(key));
}

#[test]
fn test_persistent_mapping_cannot_be_shadowed() {
    let t = TestWgl::new(Caller::Narrow);
    t.bound_context();
    let key = t.create_buffer(ARRAY_BUFFER, 32, 0);

    let result = t.wgl.map_buffer(&MapRequest::whole(
        key,
        MapAccess::WRITE | MapAccess::PERSISTENT | MapAccess::COHERENT,
    ));
    assert_eq!(result, Err(WglError::AddressUnrepresentable { size: 32 }));
    assert_eq!(t.wgl.shadow_count(), 0);
    assert!(!t.driver.is_mapped(key));
}

#[test]
fn test_map_without_current_context() {
    let t = TestWgl::new(Caller::Narrow);
    let key = t.create_buffer(ARRAY_BUFFER, 8, 0);

    assert_eq!(
        t.wgl.map_buffer(&MapRequest::whole(key, MapAccess::READ)),
        Err(WglError::DriverFailure(DriverError::Unsupported("map_buffer")))
    );
    assert!(t.wgl.unmap_buffer(key).is_err());
}

#[test]
fn test_unmap_of_unmapped_buffer_fails() {
    let t = TestWgl::new(Caller::Narrow);
    t.bound_context();
    let key = t.create_buffer(ARRAY_BUFFER, 8, 0);
    assert!(matches!(
        t.wgl.unmap_buffer(key),
        Err(WglError::DriverFailure(_))
    ));
}
