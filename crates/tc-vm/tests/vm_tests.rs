//! End-to-end tests over the public address-space API

use std::sync::Arc;
use std::time::Duration;

use tc_core::EmuStatus;
use tc_vm::{
    MemoryLocation, MemoryProfile, PageFlags, PredicateResult, ThreadToken, VmContext, VmError,
};

fn create_vm() -> Arc<VmContext> {
    VmContext::new(MemoryProfile::Ps3, EmuStatus::new()).unwrap()
}

fn create_running_vm() -> (Arc<VmContext>, EmuStatus) {
    let emu = EmuStatus::new();
    emu.run();
    let vm = VmContext::new(MemoryProfile::Ps3, emu.clone()).unwrap();
    (vm, emu)
}

#[test]
fn test_alloc_in_main_region() {
    let vm = create_vm();

    let addr = vm.alloc(0x2000, MemoryLocation::Main, 0x1000).unwrap();

    assert!(addr >= 0x0001_0000);
    assert!(addr < 0x2000_0000);
    assert_eq!(addr % 0x1000, 0);

    // both pages are mapped readable and writable
    assert!(vm.check_addr(addr, 0x2000));
    assert!(vm
        .page_protect(addr, 0x2000, PageFlags::RW, PageFlags::empty(), PageFlags::empty())
        .unwrap());

    let main = vm.get(MemoryLocation::Main, 0).unwrap().unwrap();
    assert_eq!(main.used(), 0x2000);
}

#[test]
fn test_alloc_dealloc_restores_used() {
    let vm = create_vm();
    let main = vm.get(MemoryLocation::Main, 0).unwrap().unwrap();

    let before = main.used();
    let addr = vm.alloc(0x5000, MemoryLocation::Main, 0x1000).unwrap();
    assert_ne!(addr, 0);
    assert_eq!(main.used(), before + 0x5000);

    assert!(vm.dealloc(addr, MemoryLocation::Main).unwrap());
    assert_eq!(main.used(), before);
    assert!(!vm.check_addr(addr, 1));

    // unknown address is a benign failure
    assert!(!vm.dealloc(addr, MemoryLocation::Main).unwrap());
}

#[test]
fn test_alloc_size_rounding() {
    let vm = create_vm();

    let addr = vm.alloc(0x1001, MemoryLocation::Main, 0x1000).unwrap();

    // 0x1001 rounds up to two pages
    assert!(vm.check_addr(addr, 0x2000));
    let main = vm.get(MemoryLocation::Main, 0).unwrap().unwrap();
    assert_eq!(main.used(), 0x2000);
}

#[test]
fn test_alloc_bad_alignment_is_fatal() {
    let vm = create_vm();

    assert!(matches!(
        vm.alloc(0x1000, MemoryLocation::Main, 0x800),
        Err(VmError::InvalidAlignment { .. })
    ));
    assert!(matches!(
        vm.alloc(0x1000, MemoryLocation::Main, 0x3000),
        Err(VmError::InvalidAlignment { .. })
    ));
}

#[test]
fn test_falloc_conflict() {
    let vm = create_vm();

    let addr = vm.falloc(0x2010_0000, 0x10000, MemoryLocation::User).unwrap();
    assert_eq!(addr, 0x2010_0000);
    assert!(vm.check_addr(0x2010_0000, 0x10000));

    // the range is taken now
    let again = vm.falloc(0x2010_0000, 0x1000, MemoryLocation::User).unwrap();
    assert_eq!(again, 0);

    // out of block bounds
    let outside = vm.falloc(0x1000_0000, 0x1000, MemoryLocation::User).unwrap();
    assert_eq!(outside, 0);
}

#[test]
fn test_map_unmap_roundtrip() {
    let vm = create_vm();

    let block = vm.map(0x4000_0000, 0x10000, 0).unwrap().unwrap();
    assert_eq!(block.addr(), 0x4000_0000);
    assert_eq!(block.size(), 0x10000);

    let addr = vm.falloc(0x4000_0000, 0x2000, MemoryLocation::Any).unwrap();
    assert_eq!(addr, 0x4000_0000);

    vm.write_be32(addr, 0xDEAD_BEEF).unwrap();
    assert_eq!(vm.read_be32(addr).unwrap(), 0xDEAD_BEEF);

    // overlapping block is rejected
    assert!(vm.map(0x4000_8000, 0x1000, 0).unwrap().is_none());

    drop(block);
    let removed = vm.unmap(0x4000_0000).unwrap().unwrap();
    drop(removed);

    // pages of the dropped block are gone
    assert!(!vm.check_addr(addr, 0x2000));

    // not found now
    assert!(vm.unmap(0x4000_0000).unwrap().is_none());
}

#[test]
fn test_reservation_acquire_update() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let mut buf = [0u8; 128];
    vm.reservation_acquire(&mut buf, addr).unwrap();
    assert_eq!(buf, [0u8; 128]);
    assert!(vm.reservation_test(ThreadToken::current()));

    let data = [0x5Au8; 128];
    assert!(vm.reservation_update(addr, &data).unwrap());
    assert!(!vm.reservation_test(ThreadToken::current()));

    let mut readback = [0u8; 128];
    vm.read_bytes(addr, &mut readback).unwrap();
    assert_eq!(readback, data);

    // the reservation is gone; a second update fails benignly
    assert!(!vm.reservation_update(addr, &data).unwrap());
}

#[test]
fn test_reservation_acquire_validates_flags() {
    let vm = create_vm();

    let mut buf = [0u8; 4];

    // unmapped page
    assert!(matches!(
        vm.reservation_acquire(&mut buf, 0x0010_0000),
        Err(VmError::InvalidPageFlags { .. })
    ));

    // misaligned / oversized ranges
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();
    let mut odd = [0u8; 96];
    assert!(matches!(
        vm.reservation_acquire(&mut odd, addr),
        Err(VmError::InvalidArgs { .. })
    ));
}

#[test]
fn test_reservation_op_breaks_foreign_reservation() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let mut buf = [0u8; 128];
    vm.reservation_acquire(&mut buf, addr).unwrap();

    let vm2 = vm.clone();
    std::thread::spawn(move || {
        vm2.reservation_op(addr, 128, |bytes| bytes[0] = 0xFF).unwrap();
        assert!(tc_vm::did_break_reservation());
    })
    .join()
    .unwrap();

    // the store-conditional lost
    let data = [0u8; 128];
    assert!(!vm.reservation_update(addr, &data).unwrap());

    assert_eq!(vm.read_be16(addr).unwrap(), 0xFF00);
}

#[test]
fn test_reservation_query_invalidates_on_overlap() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let mut buf = [0u8; 128];
    vm.reservation_acquire(&mut buf, addr).unwrap();

    // a write on the reserved range proceeds and breaks the slot
    assert!(vm.reservation_query(addr, 4, true, || true).unwrap());
    assert!(!vm.reservation_update(addr, &[0u8; 128]).unwrap());

    // unmapped addresses are reported benignly
    assert!(!vm.reservation_query(0x0010_0000, 4, true, || true).unwrap());
}

#[test]
fn test_reservation_query_read_does_not_invalidate() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let mut buf = [0u8; 128];
    vm.reservation_acquire(&mut buf, addr).unwrap();

    assert!(vm.reservation_query(addr, 4, false, || unreachable!()).unwrap());
    assert!(vm.reservation_update(addr, &[0u8; 128]).unwrap());
}

#[test]
fn test_reservation_free() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let mut buf = [0u8; 64];
    vm.reservation_acquire(&mut buf, addr).unwrap();
    assert!(vm.reservation_test(ThreadToken::current()));

    vm.reservation_free().unwrap();
    assert!(!vm.reservation_test(ThreadToken::current()));
    assert!(!vm.reservation_update(addr, &[0u8; 64]).unwrap());

    // freeing without a reservation is a no-op
    vm.reservation_free().unwrap();
}

#[test]
fn test_native_write_breaks_reservation() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let mut buf = [0u8; 128];
    vm.reservation_acquire(&mut buf, addr).unwrap();

    vm.write_be32(addr + 64, 0x1234_5678).unwrap();

    assert!(!vm.reservation_update(addr, &[0u8; 128]).unwrap());
    assert_eq!(vm.read_be32(addr + 64).unwrap(), 0x1234_5678);
}

#[test]
fn test_page_protect_gates_reservations() {
    let vm = create_vm();
    let addr = vm.alloc(0x2000, MemoryLocation::Main, 0x1000).unwrap();

    // drop the writable bit on the first page
    assert!(vm
        .page_protect(
            addr,
            0x1000,
            PageFlags::READABLE,
            PageFlags::empty(),
            PageFlags::WRITABLE
        )
        .unwrap());

    let mut buf = [0u8; 4];
    assert!(matches!(
        vm.reservation_acquire(&mut buf, addr),
        Err(VmError::InvalidPageFlags { .. })
    ));
    assert!(matches!(
        vm.write_be32(addr, 1),
        Err(VmError::InvalidPageFlags { .. })
    ));

    // the second page is untouched
    vm.write_be32(addr + 0x1000, 1).unwrap();

    // flag test failure is benign
    assert!(!vm
        .page_protect(
            addr,
            0x1000,
            PageFlags::WRITABLE,
            PageFlags::empty(),
            PageFlags::empty()
        )
        .unwrap());

    // restore the bit
    assert!(vm
        .page_protect(
            addr,
            0x1000,
            PageFlags::READABLE,
            PageFlags::WRITABLE,
            PageFlags::empty()
        )
        .unwrap());
    vm.write_be32(addr, 1).unwrap();
}

#[test]
fn test_page_protect_toggle() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    // overlapping set and clear toggles the bit
    assert!(vm
        .page_protect(
            addr,
            0x1000,
            PageFlags::empty(),
            PageFlags::NO_RESERVATIONS,
            PageFlags::NO_RESERVATIONS
        )
        .unwrap());

    let mut buf = [0u8; 4];
    assert!(matches!(
        vm.reservation_acquire(&mut buf, addr),
        Err(VmError::InvalidPageFlags { .. })
    ));

    // toggle back
    assert!(vm
        .page_protect(
            addr,
            0x1000,
            PageFlags::empty(),
            PageFlags::NO_RESERVATIONS,
            PageFlags::NO_RESERVATIONS
        )
        .unwrap());
    vm.reservation_acquire(&mut buf, addr).unwrap();
    vm.reservation_free().unwrap();
}

#[test]
fn test_waiter_wakes_on_reservation_op() {
    let (vm, _emu) = create_running_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let writer = {
        let vm = vm.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            vm.reservation_op(addr, 128, |bytes| bytes[0] = 0xFF).unwrap();
        })
    };

    let pred_vm = vm.clone();
    vm.wait_until(addr, 128, move || {
        let mut byte = [0u8; 1];
        if let Err(err) = pred_vm.read_bytes(addr, &mut byte) {
            return PredicateResult::Failed(err);
        }
        if byte[0] == 0xFF {
            PredicateResult::Ready
        } else {
            PredicateResult::Pending
        }
    })
    .unwrap();

    writer.join().unwrap();
    assert_eq!(vm.read_be16(addr).unwrap(), 0xFF00);
}

#[test]
fn test_wait_on_stopped_emulator_fails() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    // the emulator never ran, so a pending wait cannot block
    let result = vm.wait_until(addr, 128, || PredicateResult::Pending);
    assert!(matches!(result, Err(VmError::Stopped)));
}

#[test]
fn test_waiter_predicate_failure_resurfaces() {
    let (vm, _emu) = create_running_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    let result = vm.wait_until(addr, 128, || {
        PredicateResult::Failed(VmError::NotMapped(0x1234_5000))
    });

    assert!(matches!(result, Err(VmError::NotMapped(0x1234_5000))));
}

#[test]
fn test_notify_at_validates_range() {
    let vm = create_vm();

    assert!(matches!(
        vm.notify_at(0, 128),
        Err(VmError::InvalidArgs { .. })
    ));
    assert!(matches!(
        vm.notify_at(0x10040, 128),
        Err(VmError::InvalidArgs { .. })
    ));
    vm.notify_at(0x10000, 128).unwrap();
}

#[test]
fn test_big_endian_access() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();

    vm.write_be16(addr, 0x1234).unwrap();
    assert_eq!(vm.read_be16(addr).unwrap(), 0x1234);

    vm.write_be32(addr + 2, 0x1234_5678).unwrap();
    assert_eq!(vm.read_be32(addr + 2).unwrap(), 0x1234_5678);

    vm.write_be64(addr + 8, 0xDEAD_BEEF_CAFE_BABE).unwrap();
    assert_eq!(vm.read_be64(addr + 8).unwrap(), 0xDEAD_BEEF_CAFE_BABE);

    // byte order is big-endian in guest memory
    let mut raw = [0u8; 2];
    vm.read_bytes(addr, &mut raw).unwrap();
    assert_eq!(raw, [0x12, 0x34]);
}

#[test]
fn test_close_releases_everything() {
    let vm = create_vm();
    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();
    assert!(vm.check_addr(addr, 0x1000));

    vm.close().unwrap();

    assert!(!vm.check_addr(addr, 0x1000));
    assert!(vm.get(MemoryLocation::Main, 0).unwrap().is_none());
}

#[test]
fn test_psv_profile_layout() {
    let vm = VmContext::new(MemoryProfile::Psv, EmuStatus::new()).unwrap();

    let addr = vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap();
    assert!(addr >= 0x8100_0000);
    assert!(addr < 0x9100_0000);

    // video and stack slots are absent on this profile
    assert!(matches!(
        vm.alloc(0x1000, MemoryLocation::Video, 0x1000),
        Err(VmError::InvalidLocation(MemoryLocation::Video))
    ));
}

#[test]
fn test_psp_profile_layout() {
    let vm = VmContext::new(MemoryProfile::Psp, EmuStatus::new()).unwrap();

    let addr = vm
        .falloc(0x0001_0000, 0x1000, MemoryLocation::Scratchpad)
        .unwrap();
    assert_eq!(addr, 0x0001_0000);

    let kernel = vm.get(MemoryLocation::Kernel, 0).unwrap().unwrap();
    assert_eq!(kernel.addr(), 0x8800_0000);
    assert_eq!(kernel.size(), 0x0080_0000);

    assert!(matches!(
        vm.alloc(0x1000, MemoryLocation::Spu, 0x1000),
        Err(VmError::InvalidLocation(MemoryLocation::Spu))
    ));
}

#[test]
fn test_concurrent_allocations_do_not_overlap() {
    let vm = create_vm();
    let mut handles = Vec::new();

    for _ in 0..4 {
        let vm = vm.clone();
        handles.push(std::thread::spawn(move || {
            (0..16)
                .map(|_| vm.alloc(0x1000, MemoryLocation::Main, 0x1000).unwrap())
                .collect::<Vec<_>>()
        }));
    }

    let mut all: Vec<u32> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 64, "allocations overlapped");

    let main = vm.get(MemoryLocation::Main, 0).unwrap().unwrap();
    assert_eq!(main.used(), 64 * 0x1000);
}
