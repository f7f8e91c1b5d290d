//! Per-tick task bitmask

use bitflags::bitflags;

bitflags! {
    /// Work for one scheduler tick, executed in declaration order
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskMask: u32 {
        /// Release everything and leave the loop
        const DESTROY = 1 << 0;
        const CREATE_SCENE = 1 << 1;
        const SET_VIEWPORT = 1 << 2;
        const SET_OUTPUT_SIZE = 1 << 3;
        /// Service a pending un-projection request
        const UNPROJECT = 1 << 4;
        /// Present the current view; set every tick
        const RENDER = 1 << 5;
        /// Render a snapshot or callback frame into a download context
        const DOWNLOAD = 1 << 6;
    }
}

/// Which parameter groups changed in one apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyFlags {
    pub input_size: bool,
    pub pano_type: bool,
    pub draw_region: bool,
    pub view: bool,
}

impl DirtyFlags {
    /// Tasks implied by the changed parameters; `has_input` is false until
    /// the first frame reports a size
    pub fn tasks(&self, has_input: bool) -> TaskMask {
        let mut mask = TaskMask::RENDER;
        if (self.input_size || self.pano_type) && has_input {
            mask |= TaskMask::CREATE_SCENE;
        }
        if self.draw_region {
            mask |= TaskMask::SET_VIEWPORT;
        }
        if self.draw_region || self.input_size {
            mask |= TaskMask::SET_OUTPUT_SIZE;
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_flags_render_only() {
        assert_eq!(DirtyFlags::default().tasks(true), TaskMask::RENDER);
        let view_only = DirtyFlags {
            view: true,
            ..Default::default()
        };
        assert_eq!(view_only.tasks(true), TaskMask::RENDER);
    }

    #[test]
    fn test_scene_needs_input() {
        let flags = DirtyFlags {
            pano_type: true,
            ..Default::default()
        };
        assert_eq!(flags.tasks(false), TaskMask::RENDER);
        assert_eq!(flags.tasks(true), TaskMask::RENDER | TaskMask::CREATE_SCENE);

        let flags = DirtyFlags {
            input_size: true,
            draw_region: true,
            ..Default::default()
        };
        assert_eq!(
            flags.tasks(true),
            TaskMask::RENDER | TaskMask::CREATE_SCENE | TaskMask::SET_VIEWPORT | TaskMask::SET_OUTPUT_SIZE
        );
    }

    #[test]
    fn test_declaration_order() {
        let order: Vec<TaskMask> = TaskMask::all().iter().collect();
        assert_eq!(order.first(), Some(&TaskMask::DESTROY));
        assert_eq!(order.last(), Some(&TaskMask::DOWNLOAD));
    }
}
