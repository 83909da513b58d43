// PHASECTL TOPOLOGY AND AFFINITY
// DISCOVERS ACTIVE LOGICAL CPUS, VALIDATES CONTEXT IDS, PINS THE CONTROLLER.
// restore() PUTS BACK THE AFFINITY MASK THAT WAS IN EFFECT BEFORE pin().

use log::{debug, warn};

use crate::error::{Error, Result};

pub trait Topology {
    fn active_contexts(&self) -> usize;

    fn pin(&mut self, context: usize) -> Result<()>;

    fn restore(&mut self);
}

// VALID RANGE IS [0, active). CHECKED BEFORE ANY RESOURCE IS ACQUIRED.
pub fn validate_context(role: &str, context: usize, active: usize) -> Result<()> {
    if context < active {
        Ok(())
    } else {
        Err(Error::StartupConfig(format!(
            "invalid {} cpu {} (active hardware threads: {})",
            role, context, active
        )))
    }
}

pub struct LinuxTopology {
    active: usize,
    saved: Option<libc::cpu_set_t>,
}

impl LinuxTopology {
    pub fn discover() -> Result<Self> {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n < 1 {
            return Err(Error::StartupConfig(format!(
                "topology discovery failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { active: n as usize, saved: None })
    }

    pub fn contexts(&self) -> Vec<usize> {
        (0..self.active).collect()
    }
}

impl Topology for LinuxTopology {
    fn active_contexts(&self) -> usize {
        self.active
    }

    fn pin(&mut self, context: usize) -> Result<()> {
        unsafe {
            let mut prev: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut prev) == 0 {
                // KEEP THE FIRST SAVED MASK IF pin() IS CALLED TWICE
                self.saved.get_or_insert(prev);
            }

            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(context, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(Error::StartupConfig(format!(
                    "failed to pin controller to cpu {}: {}",
                    context,
                    std::io::Error::last_os_error()
                )));
            }
        }
        debug!("TOPOLOGY: CONTROLLER PINNED TO CPU {}", context);
        Ok(())
    }

    fn restore(&mut self) {
        let Some(prev) = self.saved.take() else {
            return;
        };
        let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &prev) };
        if rc != 0 {
            warn!("TOPOLOGY: FAILED TO RESTORE AFFINITY: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_in_range() {
        assert!(validate_context("monitor", 0, 4).is_ok());
        assert!(validate_context("monitor", 3, 4).is_ok());
    }

    #[test]
    fn validate_out_of_range_is_startup_error() {
        let e = validate_context("controller", 4, 4).unwrap_err();
        assert!(matches!(e, Error::StartupConfig(_)));
        assert!(e.to_string().contains("controller cpu 4"));
    }

    #[test]
    fn discover_finds_at_least_one_cpu() {
        let t = LinuxTopology::discover().unwrap();
        assert!(t.active_contexts() >= 1);
        assert_eq!(t.contexts().len(), t.active_contexts());
    }

    #[test]
    fn pin_and_restore_cpu0() {
        let mut t = LinuxTopology::discover().unwrap();
        // CPU 0 MAY BE OUTSIDE A RESTRICTED CPUSET (CONTAINERS); ONLY CHECK NO PANIC
        if t.pin(0).is_ok() {
            t.restore();
        }
        t.restore();
    }
}
