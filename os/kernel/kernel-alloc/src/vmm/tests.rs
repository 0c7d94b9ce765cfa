use super::*;
use crate::hosted::{DirectMap, HostRegion};
use crate::pmm::MemoryStats;

const MIB: u64 = 1 << 20;

fn pmm(region: &HostRegion, superpages: usize) -> Pmm<DirectMap> {
    unsafe { Pmm::init(DirectMap, region.layout(superpages)) }
}

fn va(a: u64) -> VirtualAddress {
    VirtualAddress::new(a)
}

/// Hold on to all but `keep` free frames until the returned vector is
/// handed back to [`give_back`].
fn drain_to(pmm: &Pmm<DirectMap>, keep: usize) -> Vec<PhysicalPage<Size4K>> {
    let n = pmm.stats().free_pages - keep;
    (0..n).map(|_| pmm.alloc_4k().unwrap()).collect()
}

fn give_back(pmm: &Pmm<DirectMap>, frames: Vec<PhysicalPage<Size4K>>) {
    for f in frames {
        pmm.free_4k(f);
    }
}

#[test]
fn grow_four_mib_takes_two_superpages_and_no_data_pages() {
    let region = HostRegion::new(16 * MIB as usize);
    let pmm = pmm(&region, 2);
    let mut vmm = Vmm::create(&pmm).unwrap();
    let before = pmm.stats();

    assert_eq!(vmm.grow(0, 4 * MIB, Perm::WRITE), Ok(4 * MIB));

    let after = pmm.stats();
    assert_eq!(after.free_superpages, 0);
    // only the level-1 table
    assert_eq!(before.free_pages - after.free_pages, 1);
    assert!(vmm.is_superpage(va(0)));
    assert!(vmm.is_superpage(va(2 * MIB)));
    assert_eq!(
        vmm.translate(va(3 * MIB)).map(|(_, p)| p),
        Some(Perm::READ | Perm::WRITE | Perm::USER)
    );
}

#[test]
fn unaligned_start_is_filled_with_pages_up_to_the_boundary() {
    let region = HostRegion::new(16 * MIB as usize);
    let pmm = pmm(&region, 2);
    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 0x1000, Perm::WRITE).unwrap();

    assert_eq!(vmm.grow(0x1000, 4 * MIB, Perm::WRITE), Ok(4 * MIB));

    assert!(!vmm.is_superpage(va(0x1000)));
    assert!(vmm.is_mapped(va(0x1F_F000)));
    assert!(vmm.is_superpage(va(2 * MIB)));
    assert_eq!(pmm.stats().free_superpages, 1);

    let mut buf = [0xFF_u8; 64];
    vmm.copy_in(&mut buf, va(0x1F_FFE0)).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "fresh memory is zeroed");
}

#[test]
fn empty_pool_falls_back_to_pages() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 0);
    let mut vmm = Vmm::create(&pmm).unwrap();
    let before = pmm.stats().free_pages;

    assert_eq!(vmm.grow(0, 2 * MIB, Perm::WRITE), Ok(2 * MIB));

    assert!(!vmm.is_superpage(va(0)));
    assert!(vmm.is_mapped(va(2 * MIB - 0x1000)));
    assert_eq!(before - pmm.stats().free_pages, 512 + 2);
}

#[test]
fn shrinking_back_restores_the_footprint() {
    let region = HostRegion::new(16 * MIB as usize);
    let pmm = pmm(&region, 2);
    let mut vmm = Vmm::create(&pmm).unwrap();
    let size = 5 * MIB + 0x123;

    // First round creates the page tables, which stay.
    vmm.grow(0, size, Perm::WRITE).unwrap();
    vmm.shrink(size, 0).unwrap();
    let settled = pmm.stats();
    assert_eq!(settled.free_superpages, 2);

    vmm.grow(0, size, Perm::WRITE).unwrap();
    assert_ne!(pmm.stats(), settled);
    assert_eq!(vmm.shrink(size, 0), Ok(0));
    assert_eq!(pmm.stats(), settled);
    assert!(!vmm.is_mapped(va(0)));
}

#[test]
fn partial_shrink_demotes_and_keeps_the_rest() {
    let region = HostRegion::new(16 * MIB as usize);
    let pmm = pmm(&region, 2);
    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 4 * MIB, Perm::WRITE).unwrap();
    vmm.copy_out(va(0x2F_0010), b"kept").unwrap();
    let before = pmm.stats();

    assert_eq!(vmm.shrink(4 * MIB, 3 * MIB), Ok(3 * MIB));

    assert!(vmm.is_superpage(va(0)));
    assert!(!vmm.is_superpage(va(2 * MIB)));
    assert!(vmm.is_mapped(va(3 * MIB - 0x1000)));
    assert!(!vmm.is_mapped(va(3 * MIB)));

    let after = pmm.stats();
    assert_eq!(after.split_superpages, 1);
    // 256 freed frames, minus the level-0 table the demotion needed
    assert_eq!(after.free_pages, before.free_pages + 256 - 1);

    let mut buf = [0_u8; 4];
    vmm.copy_in(&mut buf, va(0x2F_0010)).unwrap();
    assert_eq!(&buf, b"kept");
}

#[test]
fn unmap_across_three_superpages_frees_the_middle_and_demotes_both_edges() {
    let region = HostRegion::new(16 * MIB as usize);
    let pmm = pmm(&region, 3);
    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 6 * MIB, Perm::WRITE).unwrap();
    vmm.copy_out(va(0x8_0010), b"low").unwrap();
    vmm.copy_out(va(5 * MIB + 0x10), b"high").unwrap();
    let before = pmm.stats();
    assert_eq!(before.free_superpages, 0);

    vmm.unmap(va(MIB), 4 * MIB / Size4K::SIZE, true).unwrap();

    assert!(!vmm.is_superpage(va(0)));
    assert!(!vmm.is_superpage(va(4 * MIB)));
    assert!(vmm.is_mapped(va(MIB - 0x1000)));
    assert!(!vmm.is_mapped(va(MIB)));
    assert!(!vmm.is_mapped(va(3 * MIB)));
    assert!(!vmm.is_mapped(va(5 * MIB - 0x1000)));
    assert!(vmm.is_mapped(va(5 * MIB)));

    let after = pmm.stats();
    assert_eq!(after.free_superpages, 1);
    assert_eq!(after.split_superpages, 2);
    // two half superpages of frames, minus two level-0 tables
    assert_eq!(after.free_pages, before.free_pages + 2 * 256 - 2);

    let mut buf = [0_u8; 3];
    vmm.copy_in(&mut buf, va(0x8_0010)).unwrap();
    assert_eq!(&buf, b"low");
    let mut buf = [0_u8; 4];
    vmm.copy_in(&mut buf, va(5 * MIB + 0x10)).unwrap();
    assert_eq!(&buf, b"high");
}

#[test]
fn unmap_that_cannot_demote_keeps_every_mapping() {
    let region = HostRegion::new(16 * MIB as usize);
    let pmm = pmm(&region, 3);
    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 6 * MIB, Perm::WRITE).unwrap();
    vmm.copy_out(va(MIB + 0x20), b"first").unwrap();
    vmm.copy_out(va(4 * MIB + 0x20), b"last").unwrap();
    // enough for the first edge's level-0 table only
    let hoard = drain_to(&pmm, 1);

    let err = vmm.unmap(va(MIB), 4 * MIB / Size4K::SIZE, true).unwrap_err();
    assert!(err.is_out_of_memory(), "{err}");

    let mut a = 0;
    while a < 6 * MIB {
        assert!(vmm.is_mapped(va(a)), "{a:#x} lost");
        a += Size4K::SIZE;
    }
    assert!(vmm.is_superpage(va(2 * MIB)));
    assert!(vmm.is_superpage(va(4 * MIB)));
    assert_eq!(pmm.stats().free_superpages, 0);

    let mut buf = [0_u8; 5];
    vmm.copy_in(&mut buf, va(MIB + 0x20)).unwrap();
    assert_eq!(&buf, b"first");
    let mut buf = [0_u8; 4];
    vmm.copy_in(&mut buf, va(4 * MIB + 0x20)).unwrap();
    assert_eq!(&buf, b"last");

    give_back(&pmm, hoard);
}

#[test]
#[should_panic(expected = "unmap:")]
fn unmap_of_more_pages_than_the_address_space_panics() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut vmm = Vmm::create(&pmm).unwrap();
    let _ = vmm.unmap(va(0x1000), u64::MAX / 2, true);
}

#[test]
fn unmap_of_nothing_is_a_no_op() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut vmm = Vmm::create(&pmm).unwrap();
    let before = pmm.stats();

    vmm.unmap(va(0x4000_0000), 1000, true).unwrap();
    vmm.unmap(va(0), 0, true).unwrap();
    assert_eq!(pmm.stats(), before);

    vmm.grow(0, 0x3000, Perm::WRITE).unwrap();
    vmm.unmap(va(0), 3, true).unwrap();
    let once = pmm.stats();
    vmm.unmap(va(0), 3, true).unwrap();
    assert_eq!(pmm.stats(), once);
}

#[test]
fn failed_grow_releases_what_it_installed() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut vmm = Vmm::create(&pmm).unwrap();
    let hoard = drain_to(&pmm, 10);

    let err = vmm.grow(0, 4 * MIB, Perm::WRITE).unwrap_err();
    assert!(err.is_out_of_memory(), "{err}");

    assert!(!vmm.is_mapped(va(0)));
    assert!(!vmm.is_mapped(va(2 * MIB)));
    let stats = pmm.stats();
    assert_eq!(stats.free_superpages, 1);
    // the level-1 and one level-0 table stay linked
    assert_eq!(stats.free_pages, 10 - 2);

    give_back(&pmm, hoard);
}

#[test]
fn duplicate_copies_bytes_and_stays_independent() {
    let region = HostRegion::new(16 * MIB as usize);
    let pmm = pmm(&region, 2);
    let mut parent = Vmm::create(&pmm).unwrap();
    let size = 2 * MIB + 3 * 0x1000;
    parent.grow(0, size, Perm::WRITE).unwrap();
    parent.copy_out(va(0x10), b"superpage").unwrap();
    parent.copy_out(va(2 * MIB + 0x1FFC), b"straddle").unwrap();

    let mut child = parent.duplicate(size).unwrap();
    assert!(child.is_superpage(va(0)));

    let mut buf = [0_u8; 9];
    child.copy_in(&mut buf, va(0x10)).unwrap();
    assert_eq!(&buf, b"superpage");
    let mut buf = [0_u8; 8];
    child.copy_in(&mut buf, va(2 * MIB + 0x1FFC)).unwrap();
    assert_eq!(&buf, b"straddle");

    child.copy_out(va(0x10), b"S").unwrap();
    parent.copy_out(va(2 * MIB + 0x1FFC), b"P").unwrap();
    let mut b = [0_u8; 1];
    parent.copy_in(&mut b, va(0x10)).unwrap();
    assert_eq!(&b, b"s");
    child.copy_in(&mut b, va(2 * MIB + 0x1FFC)).unwrap();
    assert_eq!(&b, b"s");
}

#[test]
fn copy_without_superpages_uses_pages_with_the_same_permissions() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut parent = Vmm::create(&pmm).unwrap();
    parent.grow(0, 2 * MIB, Perm::WRITE | Perm::EXEC).unwrap();
    parent.copy_out(va(0x1_2345), &[7, 8, 9]).unwrap();

    let child = parent.duplicate(2 * MIB).unwrap();
    assert!(!child.is_superpage(va(0)));
    assert_eq!(
        child.translate(va(0x1_2000)).map(|(_, p)| p),
        parent.translate(va(0x1_2000)).map(|(_, p)| p)
    );
    let mut buf = [0_u8; 3];
    child.copy_in(&mut buf, va(0x1_2345)).unwrap();
    assert_eq!(buf, [7, 8, 9]);
}

#[test]
fn failed_duplicate_leaves_no_trace() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut parent = Vmm::create(&pmm).unwrap();
    parent.grow(0, 2 * MIB, Perm::WRITE).unwrap();
    let hoard = drain_to(&pmm, 100);
    let before = pmm.stats();

    let Err(err) = parent.duplicate(2 * MIB) else {
        panic!("duplicate should run out of pages");
    };
    assert!(err.is_out_of_memory(), "{err}");
    assert_eq!(pmm.stats(), before);

    give_back(&pmm, hoard);
}

#[test]
fn faults_back_lazy_heap_pages_once() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut vmm = Vmm::create(&pmm).unwrap();
    let size = 0x5000;

    assert_eq!(
        vmm.resolve_fault(size, va(0x5000), false),
        Err(FaultError::OutOfRange(va(0x5000)))
    );

    let pa = vmm.resolve_fault(size, va(0x2468), true).unwrap();
    assert_eq!(vmm.translate(va(0x2000)), Some((pa, Perm::USER_RW)));
    assert_eq!(unsafe { *DirectMap.phys_to_ptr(pa + 0x468) }, 0);

    assert_eq!(
        vmm.resolve_fault(size, va(0x2000), false),
        Err(FaultError::AlreadyMapped(va(0x2000)))
    );
}

#[test]
fn copy_out_refuses_read_only_pages() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 0x1000, Perm::empty()).unwrap();

    assert_eq!(vmm.copy_out(va(0x10), b"x"), Err(VmmError::ReadOnly(va(0))));
    assert_eq!(vmm.copy_out(va(0x1000), b"x"), Err(VmmError::Unmapped(va(0x1000))));

    let mut buf = [1_u8; 2];
    vmm.copy_in(&mut buf, va(0xFFD)).unwrap();
    assert_eq!(buf, [0, 0]);
}

#[test]
fn strings_stop_at_the_terminator_across_pages() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 0);
    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 0x2000, Perm::WRITE).unwrap();
    vmm.copy_out(va(0xFFC), b"path\0junk").unwrap();

    let mut buf = [0xAA_u8; 16];
    assert_eq!(vmm.copy_in_str(&mut buf, va(0xFFC)), Ok(4));
    assert_eq!(&buf[..5], b"path\0");
    assert_eq!(buf[5], 0xAA);

    let mut short = [0_u8; 4];
    assert_eq!(
        vmm.copy_in_str(&mut short, va(0xFFC)),
        Err(VmmError::Unterminated(va(0xFFC)))
    );

    vmm.copy_out(va(0x1FF8), b"12345678").unwrap();
    let mut buf = [0_u8; 64];
    assert_eq!(
        vmm.copy_in_str(&mut buf, va(0x1FF8)),
        Err(VmmError::Unmapped(va(0x2000)))
    );
}

#[test]
fn clear_user_inside_a_superpage_demotes_it() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 2 * MIB, Perm::WRITE).unwrap();

    vmm.clear_user(va(0x1000)).unwrap();

    assert_eq!(vmm.translate(va(0x1000)), None);
    assert!(vmm.translate(va(0x2000)).is_some());
    assert_eq!(pmm.stats().split_superpages, 1);
}

#[test]
fn free_returns_every_frame() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let before = pmm.stats();

    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 3 * MIB, Perm::WRITE).unwrap();
    vmm.free(3 * MIB);

    assert_eq!(pmm.stats(), before);
}

#[test]
fn free_with_a_demoted_superpage_returns_its_frames_to_the_page_pool() {
    let region = HostRegion::new(8 * MIB as usize);
    let pmm = pmm(&region, 1);
    let before = pmm.stats();

    let mut vmm = Vmm::create(&pmm).unwrap();
    vmm.grow(0, 2 * MIB, Perm::WRITE).unwrap();
    vmm.shrink(2 * MIB, MIB).unwrap();
    vmm.free(MIB);

    assert_eq!(
        pmm.stats(),
        MemoryStats {
            free_pages: before.free_pages + 512,
            free_superpages: 0,
            split_superpages: 1,
        }
    );
}
