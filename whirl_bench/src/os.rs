//! OS glue: CPU pinning, scheduling policy, CPU frequency
//!
//! All best-effort and Linux-specific; other platforms get stubs so the
//! benchmark still runs, just unpinned.

use std::io;

#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    // safety: cpu_set_t is plain data and the calls only read our set
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn set_fifo_sched(prio: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: prio,
    };
    // safety: param outlives the call
    let rc = unsafe {
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Current frequency of `cpu` in kHz, if the kernel exposes it.
#[cfg(target_os = "linux")]
pub fn cpu_freq_khz(cpu: usize) -> Option<u64> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/cpuinfo_cur_freq");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_fifo_sched(_prio: i32) -> io::Result<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_freq_khz(_cpu: usize) -> Option<u64> {
    None
}
