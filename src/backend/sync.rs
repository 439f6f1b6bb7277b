// Per-frame synchronization state
//
// Two independent pieces of bookkeeping:
// - FrameSync: the semaphore pair + fence owned by one frame-in-flight slot
// - ImagesInFlight: which slot fence last claimed each swap chain image
//
// The slot count bounds CPU run-ahead; the image table prevents two slots
// from recording over the same swap chain image.

use ash::vk;

use super::device::DeviceContext;
use super::error::{BackendError, Result};

/// Synchronization objects for one frame-in-flight slot.
pub struct FrameSync {
    /// Signaled by acquire, waited by the draw submission.
    pub image_available: vk::Semaphore,
    /// Signaled by the draw submission, waited by present.
    pub render_done: vk::Semaphore,
    /// Signaled by the draw submission, waited by the CPU before reusing
    /// this slot. Created signaled so the first wait passes immediately.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &DeviceContext) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .device
                .create_semaphore(&semaphore_info, None)
                .map_err(BackendError::SyncCreation)?;
            let render_done = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    return Err(BackendError::SyncCreation(e));
                }
            };
            let in_flight = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_semaphore(render_done, None);
                    return Err(BackendError::SyncCreation(e));
                }
            };
            Ok(Self {
                image_available,
                render_done,
                in_flight,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_done, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// The ring of frame-in-flight slots. `current` cycles 0..len and the slot
/// count never changes after construction.
pub struct FrameRing {
    pub slots: Vec<FrameSync>,
    current: usize,
}

impl FrameRing {
    pub fn new(device: &DeviceContext, frames_in_flight: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSync::new(device) {
                Ok(sync) => slots.push(sync),
                Err(e) => {
                    for sync in &slots {
                        sync.destroy(&device.device);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { slots, current: 0 })
    }

    pub fn current(&self) -> &FrameSync {
        &self.slots[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Advances to the next slot, wrapping at the slot count.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Gives the current slot a fresh signaled fence. Needed after a failed
    /// submission: the old fence was already reset and nothing will ever
    /// signal it, so waiting on it would hang the slot forever.
    pub fn replace_current_fence(&mut self, device: &ash::Device) -> Result<()> {
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { device.create_fence(&fence_info, None) }
            .map_err(BackendError::SyncCreation)?;
        let slot = &mut self.slots[self.current];
        unsafe { device.destroy_fence(slot.in_flight, None) };
        slot.in_flight = fence;
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        for sync in &self.slots {
            sync.destroy(device);
        }
    }
}

/// Tracks, per swap chain image, the slot fence of the frame last submitted
/// against it. All entries start out null (image never used).
pub struct ImagesInFlight {
    fences: Vec<vk::Fence>,
}

impl ImagesInFlight {
    pub fn new(image_count: usize) -> Self {
        Self {
            fences: vec![vk::Fence::null(); image_count],
        }
    }

    /// Records that `fence` now owns the image and returns the fence the
    /// caller must wait on first, if any. No wait is needed when the image
    /// was never used or when the prior user is this same slot, whose fence
    /// the caller has already waited on this frame.
    pub fn claim(&mut self, image_index: usize, fence: vk::Fence) -> Option<vk::Fence> {
        let previous = self.fences[image_index];
        self.fences[image_index] = fence;
        if previous == vk::Fence::null() || previous == fence {
            None
        } else {
            Some(previous)
        }
    }

    /// Undoes a claim whose submission never reached the GPU, so later
    /// claimers do not wait on a fence that will never signal. The entry is
    /// cleared only while it still belongs to `fence`.
    pub fn release(&mut self, image_index: usize, fence: vk::Fence) {
        if self.fences[image_index] == fence {
            self.fences[image_index] = vk::Fence::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fence(raw: u64) -> vk::Fence {
        vk::Fence::from_raw(raw)
    }

    #[test]
    fn unused_image_needs_no_wait() {
        let mut table = ImagesInFlight::new(3);
        assert_eq!(table.claim(0, fence(1)), None);
        assert_eq!(table.claim(1, fence(1)), None);
    }

    #[test]
    fn image_reclaimed_by_same_slot_needs_no_wait() {
        let mut table = ImagesInFlight::new(3);
        table.claim(2, fence(7));
        assert_eq!(table.claim(2, fence(7)), None);
    }

    #[test]
    fn image_claimed_by_other_slot_returns_its_fence() {
        let mut table = ImagesInFlight::new(3);
        table.claim(1, fence(1));
        assert_eq!(table.claim(1, fence(2)), Some(fence(1)));
        // The table now remembers the new owner.
        assert_eq!(table.claim(1, fence(2)), None);
    }

    #[test]
    fn fresh_table_starts_null() {
        let mut table = ImagesInFlight::new(2);
        // Alternate two slots over two images; only cross-slot reuse waits.
        assert_eq!(table.claim(0, fence(1)), None);
        assert_eq!(table.claim(1, fence(2)), None);
        assert_eq!(table.claim(0, fence(2)), Some(fence(1)));
        assert_eq!(table.claim(1, fence(1)), Some(fence(2)));
    }

    #[test]
    fn failed_submit_leaves_image_unclaimed() {
        let mut table = ImagesInFlight::new(3);
        table.claim(1, fence(5));
        // The submission failed, so the claim is rolled back and the next
        // claimer of the image proceeds without waiting.
        table.release(1, fence(5));
        assert_eq!(table.claim(1, fence(6)), None);
    }

    #[test]
    fn release_ignores_an_entry_claimed_by_someone_else() {
        let mut table = ImagesInFlight::new(2);
        table.claim(0, fence(1));
        table.release(0, fence(2));
        // Slot 1 still owns the image, so slot 3 must wait on its fence.
        assert_eq!(table.claim(0, fence(3)), Some(fence(1)));
    }

    #[test]
    fn ring_advances_and_wraps() {
        let mut ring = FrameRing {
            slots: (0..2)
                .map(|_| FrameSync {
                    image_available: vk::Semaphore::null(),
                    render_done: vk::Semaphore::null(),
                    in_flight: vk::Fence::null(),
                })
                .collect(),
            current: 0,
        };
        assert_eq!(ring.current_index(), 0);
        ring.advance();
        assert_eq!(ring.current_index(), 1);
        ring.advance();
        assert_eq!(ring.current_index(), 0);
    }

    #[test]
    fn two_slots_over_three_images_wait_only_on_reuse() {
        // Simulates the bookkeeping of five frames with K=2 slots cycling
        // through N=3 images in acquisition order 0,1,2,0,1. The first pass
        // over each image needs no wait; reuse by the other slot does.
        let mut table = ImagesInFlight::new(3);
        let slot_fences = [fence(10), fence(20)];
        let mut waits = Vec::new();
        for frame in 0..5u64 {
            let slot = (frame % 2) as usize;
            let image = (frame % 3) as usize;
            waits.push(table.claim(image, slot_fences[slot]));
        }
        assert_eq!(
            waits,
            vec![None, None, None, Some(fence(10)), Some(fence(20))]
        );
    }

    #[test]
    fn single_slot_ring_stays_put() {
        let mut ring = FrameRing {
            slots: vec![FrameSync {
                image_available: vk::Semaphore::null(),
                render_done: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
            }],
            current: 0,
        };
        ring.advance();
        assert_eq!(ring.current_index(), 0);
    }
}
