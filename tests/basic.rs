//! Basic integration test: use caimalloc as the global allocator and
//! exercise standard Rust collections across the small/medium/large/huge
//! tiers.

use caimalloc::{Caimalloc, StdThreadHeap};

#[global_allocator]
static GLOBAL: Caimalloc<StdThreadHeap> = Caimalloc::new();

#[test]
fn test_box() {
    let b = Box::new(42u64);
    assert_eq!(*b, 42);
    drop(b);
}

#[test]
fn test_vec() {
    let mut v = Vec::new();
    for i in 0..1000 {
        v.push(i);
    }
    assert_eq!(v.len(), 1000);
    assert_eq!(v[500], 500);
    v.clear();
}

#[test]
fn test_string() {
    let mut s = String::new();
    for _ in 0..100 {
        s.push_str("hello world ");
    }
    assert!(s.len() > 100);
}

#[test]
fn test_hashmap() {
    use std::collections::HashMap;
    let mut map = HashMap::new();
    for i in 0..500 {
        map.insert(i, format!("value_{}", i));
    }
    assert_eq!(map.len(), 500);
    assert_eq!(map[&42], "value_42");
}

#[test]
fn test_vec_of_strings() {
    let v: Vec<String> = (0..200).map(|i| format!("item_{}", i)).collect();
    assert_eq!(v.len(), 200);
    assert_eq!(v[100], "item_100");
}

#[test]
fn test_various_sizes() {
    // One allocation per tier: small, medium, large, huge.
    let _a: Box<[u8; 1]> = Box::new([0; 1]);
    let _b: Box<[u8; 64]> = Box::new([0; 64]);
    let _c: Box<[u8; 4096]> = Box::new([0; 4096]);
    let _d: Box<[u8; 1 << 20]> = Box::new([0; 1 << 20]);
}

#[test]
fn test_huge_allocation() {
    let v: Vec<u8> = vec![0xAB; 16 * 1024 * 1024];
    assert_eq!(v.len(), 16 * 1024 * 1024);
    assert!(v.iter().all(|&b| b == 0xAB));
}

#[test]
fn test_alloc_free_cycle() {
    for _ in 0..100 {
        let v: Vec<u64> = (0..100).collect();
        assert_eq!(v.len(), 100);
        drop(v);
    }
}

#[test]
fn test_realloc_via_vec_growth() {
    let mut v: Vec<u8> = Vec::with_capacity(4);
    for i in 0..10_000u32 {
        v.push((i & 0xFF) as u8);
    }
    assert_eq!(v.len(), 10_000);
}
