use std::rc::Rc;

use crate::test::tracked_cpu;
use crate::{ArrayBuffer, Error, ScalarValue};

#[test]
fn test_host_round_trip() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::from_host([1, 2, 3], &device).unwrap();

    assert_eq!(buffer.len(), 3);
    assert_eq!(buffer.capacity(), 3);
    assert!(!buffer.is_view());
    let elements: Vec<i32> = (0..3).map(|i| buffer.get(i).unwrap()).collect();
    assert_eq!(elements, vec![1, 2, 3]);
    assert_eq!(buffer.to_vec().unwrap(), vec![1, 2, 3]);
    assert_eq!(buffer.host_retainer().unwrap().as_slice(), &[1, 2, 3]);
}

#[test]
fn test_empty_host_sequence() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::<f32>::from_host(Vec::new(), &device).unwrap();
    assert!(buffer.is_empty());
    assert_eq!(buffer.to_vec().unwrap(), Vec::<f32>::new());
}

#[test]
fn test_allocate_is_zeroed_root() {
    let (device, tracking) = tracked_cpu();
    let buffer = ArrayBuffer::<u16>::allocate(5, &device).unwrap();

    assert_eq!(buffer.to_vec().unwrap(), vec![0; 5]);
    assert_eq!((buffer.start_index(), buffer.end_index()), (0, 5));
    assert!(buffer.owner().is_none());
    assert!(buffer.host_retainer().is_none());
    assert_eq!(tracking.stats().live_bytes, 10);
}

#[test]
fn test_repeating_fills_every_cell() {
    let (device, tracking) = tracked_cpu();
    let buffer = ArrayBuffer::repeating(3.5f64, 4, &device).unwrap();
    assert_eq!(buffer.to_vec().unwrap(), vec![3.5; 4]);
    assert_eq!(tracking.stats().allocations, 1);
}

#[test]
fn test_view_writes_are_visible_in_root() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::<i32>::allocate(8, &device).unwrap();
    let view = root.view(2..5);

    assert!(view.is_view());
    assert_eq!(view.len(), 3);
    assert_eq!((view.start_index(), view.end_index()), (2, 5));
    assert!(view.shares_allocation_with(&root));

    view.set(0, 42).unwrap();
    assert_eq!(root.get(2).unwrap(), 42);

    root.set(4, 7).unwrap();
    assert_eq!(view.get(2).unwrap(), 7);
    assert_eq!(view.to_vec().unwrap(), vec![42, 0, 7]);
}

#[test]
fn test_view_allocates_nothing() {
    let (device, tracking) = tracked_cpu();
    let root = ArrayBuffer::<u8>::allocate(16, &device).unwrap();
    let _views: Vec<_> = (0..4).map(|i| root.view(i..i + 4)).collect();
    assert_eq!(tracking.stats().allocations, 1);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn test_view_past_end_panics() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::<i32>::allocate(8, &device).unwrap();
    let _ = root.view(4..9);
}

#[test]
fn test_try_view_reports_invalid_range() {
    let (device, tracking) = tracked_cpu();
    let root = ArrayBuffer::<i32>::allocate(8, &device).unwrap();
    let view = root.view(2..6);

    let err = view.try_view(1..5).unwrap_err();
    assert!(matches!(err, Error::InvalidView { start: 3, end: 7, window_start: 2, window_end: 6 }));
    assert!(view.try_view(0..4).is_ok());
    assert_eq!(tracking.stats().allocations, 1);
}

#[test]
fn test_view_of_view_chains_to_owner() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::from_host(0..10, &device).unwrap();
    let outer = root.view(2..8);
    let inner = outer.view(1..3);

    assert_eq!((inner.start_index(), inner.end_index()), (3, 5));
    assert_eq!(inner.to_vec().unwrap(), vec![3, 4]);
    let owner = inner.owner().unwrap();
    assert_eq!((owner.start_index(), owner.end_index()), (2, 8));
    assert!(owner.owner().unwrap().owner().is_none());
    assert!(Rc::ptr_eq(inner.host_retainer().unwrap(), root.host_retainer().unwrap()));
}

#[test]
fn test_views_do_not_free_root_memory() {
    let (device, tracking) = tracked_cpu();
    let root = ArrayBuffer::<i64>::allocate(4, &device).unwrap();
    let view = root.view(1..3);
    let nested = view.view(0..1);

    drop(nested);
    drop(view);
    assert_eq!(tracking.stats().deallocations, 0);

    drop(root);
    let stats = tracking.stats();
    assert_eq!((stats.allocations, stats.deallocations), (1, 1));
}

#[test]
fn test_view_keeps_allocation_alive_after_root_handle_drops() {
    let (device, tracking) = tracked_cpu();
    let root = ArrayBuffer::from_host([5, 6, 7], &device).unwrap();
    let view = root.view(1..3);

    drop(root);
    assert_eq!(tracking.stats().live(), 1);
    assert_eq!(view.to_vec().unwrap(), vec![6, 7]);

    drop(view);
    assert_eq!(tracking.stats().live(), 0);
}

#[test]
fn test_host_retainer_outlives_root_handle() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::from_host(vec![1u32, 2, 3], &device).unwrap();
    let retainer = Rc::downgrade(root.host_retainer().unwrap());
    let copy = root.view(0..2).deep_copy().unwrap();

    drop(root);
    assert!(retainer.upgrade().is_some());
    drop(copy);
    assert!(retainer.upgrade().is_none());
}

#[test]
fn test_deep_copy_is_independent() {
    let (device, tracking) = tracked_cpu();
    let a = ArrayBuffer::from_host(0..6, &device).unwrap();
    let b = a.deep_copy().unwrap();
    assert_eq!(tracking.stats().allocations, 2);
    assert!(!b.shares_allocation_with(&a));
    assert!(Rc::ptr_eq(a.host_retainer().unwrap(), b.host_retainer().unwrap()));

    a.set(0, 100).unwrap();
    b.set(5, -1).unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![100, 1, 2, 3, 4, 5]);
    assert_eq!(b.to_vec().unwrap(), vec![0, 1, 2, 3, 4, -1]);
}

#[test]
fn test_deep_copy_of_view_copies_window_only() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::from_host(0..8, &device).unwrap();
    let copy = root.view(2..5).deep_copy().unwrap();

    assert!(!copy.is_view());
    assert_eq!(copy.capacity(), 3);
    assert_eq!(copy.to_vec().unwrap(), vec![2, 3, 4]);
}

#[test]
fn test_replace_range_truncates_to_source() {
    let (device, tracking) = tracked_cpu();
    let dst = ArrayBuffer::from_host(0..8, &device).unwrap();
    let src = ArrayBuffer::from_host([10, 11, 12], &device).unwrap();

    // A five-cell destination with a three-cell source replaces exactly three cells.
    dst.replace_range(1..6, &src).unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![0, 10, 11, 12, 4, 5, 6, 7]);
    assert_eq!(tracking.stats().allocations, 2);
}

#[test]
fn test_replace_range_truncates_to_destination() {
    let (device, _) = tracked_cpu();
    let dst = ArrayBuffer::from_host([0, 0, 0], &device).unwrap();
    let src = ArrayBuffer::from_host([1, 2, 3, 4], &device).unwrap();

    dst.replace_range(1..3, &src).unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_replace_range_through_view_with_overlapping_source() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::from_host(0..8, &device).unwrap();

    root.replace_range(2..8, &root.view(0..6)).unwrap();
    assert_eq!(root.to_vec().unwrap(), vec![0, 1, 0, 1, 2, 3, 4, 5]);

    let view = root.view(4..8);
    view.replace_range(0..2, &root.view(0..2)).unwrap();
    assert_eq!(root.to_vec().unwrap(), vec![0, 1, 0, 1, 0, 1, 4, 5]);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn test_replace_range_outside_window_panics() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::from_host(0..8, &device).unwrap();
    let src = ArrayBuffer::from_host([1], &device).unwrap();
    let _ = root.view(0..4).replace_range(3..5, &src);
}

#[test]
fn test_replace_range_with_elements_pairs_until_shorter() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::from_host([1u8; 6], &device).unwrap();

    buffer.replace_range_with(1..4, [9, 9]).unwrap();
    assert_eq!(buffer.to_vec().unwrap(), vec![1, 9, 9, 1, 1, 1]);

    buffer.view(3..6).replace_range_with(0..2, 5..).unwrap();
    assert_eq!(buffer.to_vec().unwrap(), vec![1, 9, 9, 5, 6, 1]);
}

#[test]
fn test_set_scalar_retains_and_does_not_alias() {
    let (device, tracking) = tracked_cpu();
    let buffer = ArrayBuffer::<i32>::allocate(4, &device).unwrap();
    let mut scalar = ScalarValue::new(&device, 7).unwrap();

    buffer.set_scalar(1, &scalar).unwrap();
    assert_eq!(buffer.get(1).unwrap(), 7);
    assert!(!scalar.is_unique(), "the array retains the scalar's buffer");
    assert!(buffer.view(1..3).retainee(0).is_some());

    scalar.write(8).unwrap();
    assert_eq!(buffer.get(1).unwrap(), 7);
    assert_eq!(buffer.retainee(1).unwrap().load().unwrap(), 7);
    assert_eq!(tracking.stats().allocations, 3);

    buffer.set(1, 3).unwrap();
    assert!(buffer.retainee(1).is_none());
}

#[test]
fn test_replace_range_moves_retainees() {
    let (device, _) = tracked_cpu();
    let src = ArrayBuffer::<i32>::allocate(2, &device).unwrap();
    let scalar = ScalarValue::new(&device, 21).unwrap();
    src.set_scalar(0, &scalar).unwrap();

    let dst = ArrayBuffer::<i32>::allocate(3, &device).unwrap();
    dst.replace_range(1..3, &src).unwrap();

    assert_eq!(dst.to_vec().unwrap(), vec![0, 21, 0]);
    assert!(Rc::ptr_eq(&dst.retainee(1).unwrap(), &src.retainee(0).unwrap()));
    assert!(dst.retainee(2).is_none());
}

#[test]
fn test_element_accessor_aliases_cell() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::from_host([1, 2, 3, 4], &device).unwrap();
    let element = buffer.view(1..4).element(2);

    assert_eq!(element.len(), 1);
    assert_eq!(element.get(0).unwrap(), 4);
    element.set(0, 77).unwrap();
    assert_eq!(buffer.get(3).unwrap(), 77);
}

#[test]
fn test_scalar_at_is_detached() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::from_host([1.0f32, 2.0, 3.0], &device).unwrap();
    let scalar = buffer.scalar_at(2).unwrap();

    buffer.set(2, 30.0).unwrap();
    assert_eq!(scalar.read().unwrap(), 3.0);
    assert!(scalar.is_unique());
}

#[test]
fn test_device_ptr_addresses_window_start() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::from_host([10, 20, 30, 40], &device).unwrap();
    let view = buffer.view(2..4);

    let (index, first, second) =
        view.with_device_ptr(|ptr| (ptr.index(), ptr.load().unwrap(), ptr.advanced(1).load().unwrap()));
    assert_eq!((index, first, second), (2, 30, 40));

    let root_address = buffer.with_device_ptr(|ptr| ptr.address() as usize);
    let view_address = view.with_device_ptr(|ptr| ptr.address() as usize);
    assert_eq!(view_address - root_address, 2 * std::mem::size_of::<i32>());
}

#[test]
#[should_panic(expected = "index 3 out of bounds")]
fn test_get_past_window_panics() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::from_host(0..8, &device).unwrap();
    let _ = buffer.view(0..3).get(3);
}

#[test]
fn test_impossible_allocation_is_an_error() {
    let (device, tracking) = tracked_cpu();
    let err = ArrayBuffer::<u8>::allocate(usize::MAX, &device).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed { bytes: usize::MAX, .. }));
    assert_eq!(tracking.stats().allocations, 0);
}

#[test]
fn test_capacity_overflow_is_an_error() {
    let (device, tracking) = tracked_cpu();
    let err = ArrayBuffer::<u64>::repeating(1, usize::MAX / 2, &device).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed { .. }));
    assert_eq!(tracking.stats().allocations, 0);
}

#[test]
fn test_array_writes_never_reach_stored_scalar() {
    let (device, _) = tracked_cpu();
    let buffer = ArrayBuffer::<i32>::allocate(3, &device).unwrap();
    let scalar = ScalarValue::new(&device, 7).unwrap();
    buffer.set_scalar(0, &scalar).unwrap();
    buffer.set_scalar(1, &scalar).unwrap();

    buffer.set(0, 55).unwrap();
    buffer.with_device_ptr_mut(|ptr| ptr.advanced(1).assign(56)).unwrap();
    buffer.replace_range_with(2..3, [57]).unwrap();

    assert_eq!(buffer.to_vec().unwrap(), vec![55, 56, 57]);
    assert_eq!(scalar.read().unwrap(), 7);
    assert!(scalar.is_unique(), "array writes release the retained scalar");
}

#[test]
fn test_mutable_device_ptr_writes_shared_cells() {
    let (device, _) = tracked_cpu();
    let root = ArrayBuffer::from_host([1, 2, 3, 4], &device).unwrap();
    let scalar = ScalarValue::new(&device, 9).unwrap();
    root.set_scalar(0, &scalar).unwrap();
    let view = root.view(2..4);

    view.with_device_ptr_mut(|ptr| ptr.assign_from_host(&[30, 40])).unwrap();
    assert_eq!(root.to_vec().unwrap(), vec![9, 2, 30, 40]);
    assert!(root.retainee(0).is_some(), "cells outside the window keep their retainee");
}
