mod common;

use aero_vmem::pte::MAX_PHYSICAL_ADDRESS;
use aero_vmem::{
    AddressSpace, AddressSpaceOptions, BackingError, HostMemory, VmemError, PAGE_SIZE,
};
use common::{recording_space, Event};

#[test]
fn size_rounds_up_to_power_of_two_pages() {
    let space = AddressSpace::new(HostMemory::new(0).unwrap(), 5000).unwrap();
    assert_eq!(space.address_space_size(), 8192);
    assert_eq!(space.address_space_bits(), 13);
    assert_eq!(space.page_count(), 2);

    let space = AddressSpace::new(HostMemory::new(0).unwrap(), 1).unwrap();
    assert_eq!(space.address_space_size(), PAGE_SIZE);
    assert_eq!(space.address_space_bits(), 12);

    let space = AddressSpace::new(HostMemory::new(0).unwrap(), 0x10_0000).unwrap();
    assert_eq!(space.address_space_size(), 0x10_0000);
    assert_eq!(space.address_space_bits(), 20);
}

#[test]
fn oversized_address_space_is_rejected() {
    let err = AddressSpace::new(HostMemory::new(0).unwrap(), u64::MAX).err();
    assert_eq!(err, Some(VmemError::AddressSpaceTooLarge { size: u64::MAX }));
}

#[test]
fn map_translate_unmap() {
    let space = recording_space(0x10_0000, 0x4000);
    assert_eq!(space.translate(0x1000), None);

    space.map(0x1000, 0x2000, 0x2000).unwrap();
    assert_eq!(space.translate(0x1000), Some(0x2000));
    assert_eq!(space.translate(0x1abc), Some(0x2abc));
    assert_eq!(space.translate(0x2fff), Some(0x3fff));
    assert_eq!(space.translate(0x3000), None);
    assert!(space.is_mapped(0x2000));
    assert!(space.is_range_mapped(0x1000, 0x2000));
    assert!(!space.is_range_mapped(0x1000, 0x2001));

    space.unmap(0x1000, 0x1000).unwrap();
    assert_eq!(space.translate(0x1000), None);
    assert_eq!(space.translate(0x2000), Some(0x3000));

    assert_eq!(
        space.tracking().events(),
        vec![
            Event::Map {
                va: 0x1000,
                size: 0x2000
            },
            Event::Unmap {
                va: 0x1000,
                size: 0x1000
            },
        ]
    );
}

#[test]
fn physical_frame_zero_is_mapped() {
    let space = recording_space(0x4000, 0x1000);
    space.map(0x3000, 0, PAGE_SIZE).unwrap();
    assert!(space.is_mapped(0x3000));
    assert_eq!(space.translate(0x3004), Some(4));
}

#[test]
fn remap_replaces_the_target() {
    let space = recording_space(0x4000, 0x4000);
    space.map(0, 0x1000, PAGE_SIZE).unwrap();
    space.map(0, 0x3000, PAGE_SIZE).unwrap();
    assert_eq!(space.translate(0x10), Some(0x3010));
}

#[test]
fn addresses_outside_the_space_are_invalid() {
    let space = recording_space(5000, 0x2000);
    assert!(space.validate_address(0x1fff));
    assert!(!space.validate_address(0x2000));
    assert!(space.validate_range(0x1000, 0x1000));
    assert!(!space.validate_range(0x1000, 0x1001));
    assert!(!space.validate_range(u64::MAX, 2));

    assert_eq!(space.translate(0x2000), None);
    assert!(!space.is_mapped(u64::MAX));
    assert_eq!(
        space.map(0x1000, 0, 0x2000),
        Err(VmemError::InvalidMemoryRegion {
            va: 0x1000,
            size: 0x2000
        })
    );
    assert_eq!(
        space.unmap(0x2000, 0x1000),
        Err(VmemError::InvalidMemoryRegion {
            va: 0x2000,
            size: 0x1000
        })
    );
    assert!(space.tracking().events().is_empty());
}

#[test]
fn map_past_the_backing_store_fails() {
    let space = recording_space(0x10000, 0x2000);
    let err = space.map(0, 0x1000, 0x2000).unwrap_err();
    assert_eq!(
        err,
        VmemError::Backing(BackingError::OutOfRange {
            offset: 0x1000,
            len: 0x2000,
            size: 0x2000
        })
    );
    assert_eq!(space.translate(0), None);
}

#[test]
fn map_past_the_physical_address_field_fails() {
    let space = recording_space(0x10000, 0x2000);
    let pa = MAX_PHYSICAL_ADDRESS + 1;
    assert_eq!(
        space.map(0, pa, PAGE_SIZE),
        Err(VmemError::PhysicalOutOfRange { pa, size: PAGE_SIZE })
    );
    assert_eq!(
        space.map(0, u64::MAX & !(PAGE_SIZE - 1), 2 * PAGE_SIZE),
        Err(VmemError::PhysicalOutOfRange {
            pa: u64::MAX & !(PAGE_SIZE - 1),
            size: 2 * PAGE_SIZE
        })
    );
    assert!(space.tracking().events().is_empty());
}

#[test]
fn options_deserialize_with_defaults() {
    let options: AddressSpaceOptions = serde_json::from_str(r#"{"size": 65536}"#).unwrap();
    assert_eq!(options, AddressSpaceOptions::new(0x10000));
    assert!(!options.track_reads);

    let options: AddressSpaceOptions = serde_json::from_str("{}").unwrap();
    assert_eq!(options, AddressSpaceOptions::default());

    let json = serde_json::to_value(AddressSpaceOptions {
        size: 4096,
        track_reads: true,
    })
    .unwrap();
    assert_eq!(json, serde_json::json!({ "size": 4096, "track_reads": true }));
}
