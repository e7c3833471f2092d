// Image layout state machine
//
// Layout changes are only allowed along a fixed set of edges. Each edge knows
// the access masks and pipeline stages its barrier needs. Anything outside the
// set is rejected so a bad upload path shows up as an error instead of a
// silently "fixed" layout.

use ash::vk;

use crate::error::ResourceError;

/// Barrier parameters for one allowed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the barrier for `old -> new`
pub fn transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Transition, ResourceError> {
    use ash::vk::AccessFlags as A;
    use ash::vk::ImageLayout as L;
    use ash::vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_WRITE, S::FRAGMENT_SHADER, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::TRANSFER_READ, S::TRANSFER, S::TRANSFER)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_READ, S::FRAGMENT_SHADER, S::TRANSFER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_READ, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::TRANSFER_READ, A::TRANSFER_WRITE, S::TRANSFER, S::TRANSFER)
        }
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        (from, to) => return Err(ResourceError::UnsupportedTransition { from, to }),
    };

    Ok(Transition {
        old_layout: old,
        new_layout: new,
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

/// Tracks the current layout of one image and validates every change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTracker {
    current: vk::ImageLayout,
}

impl Default for LayoutTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutTracker {
    pub fn new() -> Self {
        Self {
            current: vk::ImageLayout::UNDEFINED,
        }
    }

    pub fn current(&self) -> vk::ImageLayout {
        self.current
    }

    /// Validate `current -> new` and move to `new`.
    ///
    /// On error the tracked layout is left untouched.
    pub fn advance(&mut self, new: vk::ImageLayout) -> Result<Transition, ResourceError> {
        let transition = transition(self.current, new)?;
        self.current = new;
        Ok(transition)
    }

    /// Move from `from` to `to` once work recorded against `from` was submitted.
    ///
    /// Fails and keeps the current layout if the image is no longer in `from`.
    pub fn commit(&mut self, from: vk::ImageLayout, to: vk::ImageLayout) -> Result<(), ResourceError> {
        if self.current != from {
            return Err(ResourceError::StaleLayout {
                expected: from,
                found: self.current,
            });
        }
        self.current = to;
        Ok(())
    }

    /// Record the layout a render pass left the image in
    pub fn assume(&mut self, layout: vk::ImageLayout) {
        self.current = layout;
    }
}

/// Record the pipeline barrier for `transition` on `image`
pub fn record_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    subresource_range: vk::ImageSubresourceRange,
    transition: &Transition,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
        .old_layout(transition.old_layout)
        .new_layout(transition.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            transition.src_stage,
            transition.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::ImageLayout as L;

    const LAYOUTS: [vk::ImageLayout; 7] = [
        L::UNDEFINED,
        L::GENERAL,
        L::TRANSFER_SRC_OPTIMAL,
        L::TRANSFER_DST_OPTIMAL,
        L::SHADER_READ_ONLY_OPTIMAL,
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        L::PRESENT_SRC_KHR,
    ];

    const ALLOWED: [(vk::ImageLayout, vk::ImageLayout); 8] = [
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL),
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL),
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
        (L::TRANSFER_SRC_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];

    #[test]
    fn upload_cycle_is_allowed() {
        let mut tracker = LayoutTracker::new();
        for layout in [
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        ] {
            tracker.advance(layout).unwrap();
        }
        assert_eq!(tracker.current(), L::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn every_unlisted_pair_is_rejected_without_state_change() {
        for &from in &LAYOUTS {
            for &to in &LAYOUTS {
                let listed = ALLOWED.contains(&(from, to));
                let mut tracker = LayoutTracker::new();
                tracker.assume(from);

                match tracker.advance(to) {
                    Ok(t) => {
                        assert!(listed, "{:?} -> {:?} should be rejected", from, to);
                        assert_eq!(t.old_layout, from);
                        assert_eq!(tracker.current(), to);
                    }
                    Err(err) => {
                        assert!(!listed, "{:?} -> {:?} should be allowed", from, to);
                        assert_eq!(err, ResourceError::UnsupportedTransition { from, to });
                        assert_eq!(tracker.current(), from);
                    }
                }
            }
        }
    }

    #[test]
    fn commit_applies_only_from_the_planned_layout() {
        let mut tracker = LayoutTracker::new();
        tracker.commit(L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(tracker.current(), L::SHADER_READ_ONLY_OPTIMAL);

        let err = tracker
            .commit(L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL)
            .unwrap_err();
        assert_eq!(
            err,
            ResourceError::StaleLayout {
                expected: L::UNDEFINED,
                found: L::SHADER_READ_ONLY_OPTIMAL,
            }
        );
        assert_eq!(tracker.current(), L::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn shader_read_waits_on_transfer_write() {
        let t = transition(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(t.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }
}
