use bitflags::bitflags;

/// Result of a handler callback or loop hook: keep looping, leave the loop
/// normally, or leave the loop with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Stop,
    Fail,
}

/// Opaque registration token, embedded as the epoll user data. Tokens are
/// allocated monotonically and never reused within a loop's lifetime, so a
/// token always resolves to at most one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

bitflags! {
    /// Readiness kinds a descriptor subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
        const URGENT = libc::EPOLLPRI as u32;
    }
}

bitflags! {
    /// Readiness kinds reported by the kernel. Unknown bits are retained so
    /// they can be surfaced through the unknown-event callback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
        const URGENT = libc::EPOLLPRI as u32;
        const HANGUP = libc::EPOLLHUP as u32;
        const ERROR = libc::EPOLLERR as u32;
        const _ = !0;
    }
}

impl Readiness {
    pub fn is_readable(&self) -> bool {
        self.contains(Readiness::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Readiness::WRITE)
    }

    pub fn is_hangup(&self) -> bool {
        self.contains(Readiness::HANGUP)
    }

    pub fn is_error(&self) -> bool {
        self.contains(Readiness::ERROR)
    }
}

/// One slot of a wait batch: the registration token and the readiness bits
/// the kernel reported for it. The whole-batch hook receives these mutably
/// and may clear bits to suppress dispatch of a slot.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: Token,
    pub readiness: Readiness,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_retains_unknown_bits() {
        let bits = Readiness::READ.bits() | (libc::EPOLLRDHUP as u32);
        let r = Readiness::from_bits_retain(bits);
        assert!(r.is_readable());
        let mut rest = r;
        rest.remove(Readiness::READ);
        assert!(!rest.is_empty());
        assert_eq!(rest.bits(), libc::EPOLLRDHUP as u32);
    }

    #[test]
    fn test_interest_compose() {
        let i = Interest::READ | Interest::WRITE;
        assert!(i.contains(Interest::READ));
        assert!(!i.contains(Interest::URGENT));
    }
}
