//! Request priorities and cancellation scopes.

/// Priority of an image request.
///
/// Variants are declared lowest first. The queue always drains the highest
/// non-empty priority before looking at a lower one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    /// Background batch thumbnail build.
    BuildThumbnails = 0,
    /// Scoped or background rebuild of thumbnails.
    BuildScopeThumbnails = 1,
    /// Thumbnails in the current scope that are not on screen.
    ThumbnailInvisible = 2,
    /// Images the viewer is likely to show next.
    ViewerPreload = 3,
    /// Interactive batch tasks.
    BatchTask = 4,
    /// Thumbnails visible on screen.
    #[default]
    ThumbnailVisible = 5,
    /// The image shown in the foreground viewer.
    Viewer = 6,
}

impl Priority {
    /// Number of priority levels; sizes the queue's bucket array.
    pub const COUNT: usize = 7;

    /// All priorities, lowest first.
    pub const ALL: [Self; Self::COUNT] = [
        Self::BuildThumbnails,
        Self::BuildScopeThumbnails,
        Self::ThumbnailInvisible,
        Self::ViewerPreload,
        Self::BatchTask,
        Self::ThumbnailVisible,
        Self::Viewer,
    ];

    /// Returns the bucket index for this priority.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BuildThumbnails => "build-thumbnails",
            Self::BuildScopeThumbnails => "build-scope-thumbnails",
            Self::ThumbnailInvisible => "thumbnail-invisible",
            Self::ViewerPreload => "viewer-preload",
            Self::BatchTask => "batch-task",
            Self::ThumbnailVisible => "thumbnail-visible",
            Self::Viewer => "viewer",
        };
        write!(f, "{name}")
    }
}

/// Which of a client's requests a stop call cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopAction {
    /// Cancel every request of the client.
    #[default]
    StopAll,
    /// Cancel only requests below on-screen visible priority.
    StopOnlyNonPriorityLoads,
}

impl StopAction {
    /// Returns true if a request at `priority` falls under this scope.
    #[must_use]
    pub fn covers(self, priority: Priority) -> bool {
        match self {
            Self::StopAll => true,
            Self::StopOnlyNonPriorityLoads => priority < Priority::ThumbnailVisible,
        }
    }
}

/// Priority vocabulary of the external video thumbnail job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoJobPriority {
    /// Run ahead of background jobs.
    Foreground,
    /// Run when nothing else is pending.
    Background,
}

impl From<Priority> for VideoJobPriority {
    fn from(priority: Priority) -> Self {
        if priority > Priority::ThumbnailInvisible {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}
