//! Eviction integration tests
//!
//! Clock second-chance selection, the swap and file flush paths, the
//! fault-restore round trips and the behavior under concurrent pressure.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ferrite_kernel::fs::BackingFile;
use ferrite_kernel::mm::fault::handle_user_fault;
use ferrite_kernel::mm::{
    ptov, vtop, AllocFlags, PageSubsystem, PoolKind, PteContent, PteFlags, Spte, SpteFlags,
    VirtAddr, PAGE_SIZE,
};
use ferrite_kernel::process::Process;

fn upage(n: usize) -> VirtAddr {
    VirtAddr::new(n * PAGE_SIZE)
}

/// Map an anonymous page the way a fault handler would and write a
/// recognizable pattern into it while the entry is still pinned.
fn map_anon_with_pattern(sys: &PageSubsystem, cur: &Process, n: usize, pattern: u8) -> VirtAddr {
    let kva = sys
        .get_page(AllocFlags::USER | AllocFlags::ZERO, cur, Some(upage(n)))
        .expect("user allocation with eviction cannot fail");
    sys.mem().fill(kva, pattern, PAGE_SIZE);

    let pte = cur.pagedir.lookup_page(upage(n), false).unwrap();
    pte.install(vtop(kva), PteFlags::WRITABLE | PteFlags::USER);
    pte.set_dirty(true);
    pte.set_accessed(true);
    pte.set_pinned(false);
    kva
}

/// Fault the page back in if needed and return its current contents.
fn read_page(sys: &PageSubsystem, cur: &Process, n: usize) -> [u8; PAGE_SIZE] {
    handle_user_fault(sys, cur, upage(n)).expect("fault-in cannot fail");
    let pte = cur.pagedir.lookup_page(upage(n), false).unwrap();
    assert!(pte.is_present());
    let mut buf = [0u8; PAGE_SIZE];
    sys.mem().copy_out(ptov(pte.phys_addr()), &mut buf);
    buf
}

#[test]
fn fifth_page_evicts_the_first_and_swap_round_trips() {
    // User pool of 4 frames.
    let sys = PageSubsystem::new(48, 5, 16);
    let cur = Process::new();
    assert_eq!(sys.pool_stats(PoolKind::User).total, 4);

    let mut kvas = Vec::new();
    for n in 0..5 {
        kvas.push(map_anon_with_pattern(&sys, &cur, n, 0xa0 + n as u8));
    }

    // Every frame was accessed once, so the clock spends all four
    // accessed bits and takes frame 0 for the fifth page.
    assert_eq!(kvas[4], kvas[0]);
    assert_eq!(kvas[4], sys.pool_base(PoolKind::User));

    let pte0 = cur.pagedir.lookup_page(upage(0), false).unwrap();
    assert!(matches!(pte0.content(), PteContent::Swapped(_)));
    assert_eq!(sys.swap().used_slots(), 1);

    // Touching page 0 faults it back in with its pattern intact.
    let buf = read_page(&sys, &cur, 0);
    assert!(buf.iter().all(|&b| b == 0xa0));
}

#[test]
fn second_chance_spends_accessed_bits_before_evicting() {
    // User pool of 3 frames.
    let sys = PageSubsystem::new(40, 4, 16);
    let cur = Process::new();
    assert_eq!(sys.pool_stats(PoolKind::User).total, 3);

    for n in 0..3 {
        map_anon_with_pattern(&sys, &cur, n, 0x10 + n as u8);
    }

    // All three have their accessed bit set; the new allocation clears
    // them on the first lap and evicts the first frame on the second.
    let kva = map_anon_with_pattern(&sys, &cur, 3, 0x13);
    assert_eq!(kva, sys.pool_base(PoolKind::User));

    let pte0 = cur.pagedir.lookup_page(upage(0), false).unwrap();
    let pte1 = cur.pagedir.lookup_page(upage(1), false).unwrap();
    let pte2 = cur.pagedir.lookup_page(upage(2), false).unwrap();
    assert!(matches!(pte0.content(), PteContent::Swapped(_)));
    assert!(pte1.is_present());
    assert!(pte2.is_present());
    // Their second chances are spent.
    assert!(!pte1.is_accessed());
    assert!(!pte2.is_accessed());
}

#[test]
fn pinned_frames_survive_sustained_pressure() {
    let sys = PageSubsystem::new(48, 5, 16);
    let cur = Process::new();

    for n in 0..4 {
        map_anon_with_pattern(&sys, &cur, n, n as u8);
    }
    let pinned = cur.pagedir.lookup_page(upage(1), false).unwrap();
    pinned.set_pinned(true);

    // Enough allocations to lap the clock several times.
    for n in 4..8 {
        map_anon_with_pattern(&sys, &cur, n, n as u8);
    }
    assert!(pinned.is_present(), "pinned frame was evicted");
}

#[test]
fn all_pinned_blocks_until_a_concurrent_unpin() {
    let sys = PageSubsystem::new(40, 4, 16);
    let cur = Process::new();

    for n in 0..3 {
        map_anon_with_pattern(&sys, &cur, n, n as u8);
        cur.pagedir
            .lookup_page(upage(n), false)
            .unwrap()
            .set_pinned(true);
    }

    thread::scope(|s| {
        let handle = s.spawn(|| {
            // Every candidate is pinned; this blocks until one is not.
            map_anon_with_pattern(&sys, &cur, 3, 3)
        });

        thread::sleep(Duration::from_millis(30));
        cur.pagedir
            .lookup_page(upage(0), false)
            .unwrap()
            .set_pinned(false);

        let kva = handle.join().expect("allocation completes after the unpin");
        assert_eq!(kva, sys.pool_base(PoolKind::User));
    });

    let pte0 = cur.pagedir.lookup_page(upage(0), false).unwrap();
    assert!(matches!(pte0.content(), PteContent::Swapped(_)));
}

#[test]
fn concurrent_evictors_take_distinct_frames() {
    let sys = PageSubsystem::new(48, 5, 16);
    let cur = Process::new();

    let mut kvas = Vec::new();
    for n in 0..4 {
        kvas.push(map_anon_with_pattern(&sys, &cur, n, n as u8));
    }
    // Leave only frames 0 and 1 evictable.
    for n in 2..4 {
        cur.pagedir
            .lookup_page(upage(n), false)
            .unwrap()
            .set_pinned(true);
    }

    let (a, b) = thread::scope(|s| {
        let ta = s.spawn(|| map_anon_with_pattern(&sys, &cur, 4, 0x44));
        let tb = s.spawn(|| map_anon_with_pattern(&sys, &cur, 5, 0x55));
        (ta.join().unwrap(), tb.join().unwrap())
    });

    assert_ne!(a, b, "two evictors claimed the same frame");
    for kva in [a, b] {
        assert!(kva == kvas[0] || kva == kvas[1]);
    }

    // The pinned mappings were untouched, the evicted ones went to swap.
    for n in 2..4 {
        let pte = cur.pagedir.lookup_page(upage(n), false).unwrap();
        assert!(pte.is_present());
    }
    for n in 0..2 {
        let pte = cur.pagedir.lookup_page(upage(n), false).unwrap();
        assert!(matches!(pte.content(), PteContent::Swapped(_)));
    }
    assert_eq!(sys.swap().used_slots(), 2);

    // Contents still round-trip.
    assert!(read_page(&sys, &cur, 0).iter().all(|&x| x == 0));
    assert!(read_page(&sys, &cur, 1).iter().all(|&x| x == 1));
}

#[test]
fn dirty_mmap_pages_write_back_to_the_file_not_swap() {
    // User pool of 2 frames.
    let sys = PageSubsystem::new(40, 3, 8);
    let cur = Process::new();
    assert_eq!(sys.pool_stats(PoolKind::User).total, 2);

    // Map one file page at user page 0.
    let file = Arc::new(BackingFile::from_bytes(&[0x11u8; PAGE_SIZE]));
    let mpte = cur.pagedir.lookup_page(upage(0), true).unwrap();
    mpte.set_mapped_file(true);
    cur.suppl_pt.insert(Arc::new(Spte::new(
        Arc::clone(&mpte),
        SpteFlags::MMAP,
        Arc::clone(&file),
        0,
        PAGE_SIZE,
    )));

    handle_user_fault(&sys, &cur, upage(0)).expect("file-backed fault-in succeeds");
    let kva = ptov(mpte.phys_addr());
    let mut buf = [0u8; PAGE_SIZE];
    sys.mem().copy_out(kva, &mut buf);
    assert!(buf.iter().all(|&b| b == 0x11), "fault-in missed file data");

    // Dirty the mapping.
    sys.mem().fill(kva, 0x77, PAGE_SIZE);
    mpte.set_dirty(true);
    mpte.set_accessed(true);

    // Fill the pool and force an eviction pass over the mmap page.
    map_anon_with_pattern(&sys, &cur, 1, 0x01);
    map_anon_with_pattern(&sys, &cur, 2, 0x02);

    assert_eq!(mpte.content(), PteContent::FileBacked);
    let mut back = [0u8; PAGE_SIZE];
    assert_eq!(file.read_at(&mut back, 0), PAGE_SIZE);
    assert!(back.iter().all(|&b| b == 0x77), "dirty data not written back");
    // The mmap page consumed no swap.
    assert_eq!(sys.swap().used_slots(), 0);

    // Re-faulting reads from the file, still not from swap.
    let buf = read_page(&sys, &cur, 0);
    assert!(buf.iter().all(|&b| b == 0x77));
    let swapped_for_mmap = matches!(mpte.content(), PteContent::Swapped(_));
    assert!(!swapped_for_mmap);
}

#[test]
fn a_held_frame_lock_makes_the_clock_skip_that_frame() {
    // User pool of 2 frames.
    let sys = PageSubsystem::new(40, 3, 8);
    let cur = Process::new();

    let kva0 = map_anon_with_pattern(&sys, &cur, 0, 0x01);
    let kva1 = map_anon_with_pattern(&sys, &cur, 1, 0x02);
    let pte0 = cur.pagedir.lookup_page(upage(0), false).unwrap();

    // Hold frame 0's eviction lock, as a fault handler inspecting that
    // frame would.
    let frame_lock = sys.user_frame_lock_for(&pte0);
    let guard = frame_lock.lock();

    // The clock cannot take frame 0, so frame 1 goes even though frame 0
    // sits earlier in clock order.
    let kva = map_anon_with_pattern(&sys, &cur, 2, 0x03);
    assert_eq!(kva, kva1);
    assert!(pte0.is_present(), "locked frame was evicted");
    drop(guard);

    let mut buf = [0u8; PAGE_SIZE];
    sys.mem().copy_out(kva0, &mut buf);
    assert!(buf.iter().all(|&b| b == 0x01));
}

#[test]
fn kernel_frames_are_never_eviction_victims() {
    let sys = PageSubsystem::new(48, 5, 32);
    let cur = Process::new();

    let krun = sys
        .get_multiple(AllocFlags::empty(), 4, &cur, None)
        .expect("kernel pool has room");
    sys.mem().fill(krun, 0x5c, 4 * PAGE_SIZE);
    let kstats = sys.pool_stats(PoolKind::Kernel);

    // Heavy user churn: three times the pool size.
    for n in 0..12 {
        map_anon_with_pattern(&sys, &cur, n, 0x80 + n as u8);
    }

    assert_eq!(sys.pool_stats(PoolKind::Kernel), kstats);
    let mut buf = [0u8; PAGE_SIZE];
    for k in 0..4 {
        sys.mem().copy_out(krun.add(k * PAGE_SIZE), &mut buf);
        assert!(buf.iter().all(|&b| b == 0x5c), "kernel page {k} was clobbered");
    }
}

#[test]
fn patterns_survive_churn_from_two_threads() {
    let sys = PageSubsystem::new(48, 5, 64);
    let cur = Process::new();

    // Each thread populates its own six pages under shared pressure on a
    // four-frame pool; most of them get evicted along the way.
    thread::scope(|s| {
        for t in 0..2u8 {
            let sys = &sys;
            let cur = &cur;
            s.spawn(move || {
                for i in 0..6usize {
                    let n = 16 + t as usize * 8 + i;
                    map_anon_with_pattern(sys, cur, n, 0x30 + t * 0x10 + i as u8);
                }
            });
        }
    });

    // Every page faults back in with the pattern its writer left.
    for t in 0..2u8 {
        for i in 0..6usize {
            let n = 16 + t as usize * 8 + i;
            let buf = read_page(&sys, &cur, n);
            let want = 0x30 + t * 0x10 + i as u8;
            assert!(
                buf.iter().all(|&b| b == want),
                "page {n} lost its pattern"
            );
        }
    }
}
