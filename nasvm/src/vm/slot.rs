use nasvm_protocol::SpecError;

/// First PCI slot handed to guest devices. 0 is the host bridge; 1 and 2 are
/// left free.
pub const SLOT_BASE: u8 = 3;

/// Slots 29 (framebuffer), 30 (xhci tablet) and 31 (LPC) are fixed.
pub const SLOT_LIMIT: u8 = 29;

pub const FRAMEBUFFER_SLOT: u8 = 29;
pub const TABLET_SLOT: u8 = 30;

/// Hands out sequential PCI slot numbers for one hypervisor invocation.
#[derive(Debug)]
pub struct SlotAllocator {
    next: u8,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self { next: SLOT_BASE }
    }

    pub fn allocate(&mut self) -> Result<u8, SpecError> {
        if self.next >= SLOT_LIMIT {
            return Err(SpecError::TooManyDevices {
                max: SLOT_LIMIT - SLOT_BASE,
            });
        }
        let slot = self.next;
        self.next += 1;
        Ok(slot)
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_sequential_from_base() {
        let mut slots = SlotAllocator::new();
        let got: Vec<u8> = (0..5).map(|_| slots.allocate().unwrap()).collect();
        assert_eq!(got, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_allocator_stops_before_fixed_slots() {
        let mut slots = SlotAllocator::new();
        let mut last = 0;
        for _ in 0..26 {
            last = slots.allocate().unwrap();
        }
        assert_eq!(last, 28);
        assert_eq!(
            slots.allocate().unwrap_err(),
            SpecError::TooManyDevices { max: 26 }
        );
    }
}
