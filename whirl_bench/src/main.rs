//! bm_lock: stress and measure the lock family
//!
//! Drives N pinned worker threads against M cache-line-aligned objects,
//! each of which carries one instance of every lock kind plus a pair of
//! occupancy counters. Every lap a worker picks a pseudo-random object and
//! runs either a shared or an exclusive critical section under the
//! selected lock type, verifying on the way through that nobody else is
//! where the lock says they cannot be. Reports per-thread counters,
//! throughput, and a geometric-mean fairness index.

mod os;

use std::env;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use whirl_sync::arch::*;
use whirl_sync::locks::{ClhLock, ClhSlot, PfRwLock, RwLock, SpinLock, TfRwLock, TicketLock};
use whirl_sync::util::CacheAligned;

/// Bounded by the barrier word, one bit per thread.
const MAXTHREADS: u32 = 64;

/// SCHED_FIFO priority for the workers.
const PRIO: i32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LockType {
    Plain,
    Rw,
    Tfrw,
    Pfrw,
    Clh,
    Tkt,
}

impl LockType {
    const ALL: [LockType; 6] = [
        LockType::Plain,
        LockType::Rw,
        LockType::Tfrw,
        LockType::Pfrw,
        LockType::Clh,
        LockType::Tkt,
    ];

    fn abbr(self) -> &'static str {
        match self {
            LockType::Plain => "plain",
            LockType::Rw => "rw",
            LockType::Tfrw => "tfrw",
            LockType::Pfrw => "pfrw",
            LockType::Clh => "clh",
            LockType::Tkt => "tkt",
        }
    }

    fn long_name(self) -> &'static str {
        match self {
            LockType::Plain => "plain spin",
            LockType::Rw => "read/write",
            LockType::Tfrw => "task fair read/write",
            LockType::Pfrw => "phase fair read/write",
            LockType::Clh => "CLH",
            LockType::Tkt => "ticket",
        }
    }

    fn from_abbr(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.abbr() == s)
    }
}

/// One lock-protected test record. Every lock kind is co-resident so the
/// same object array serves all benchmark modes; the occupancy counters
/// get their own cache lines so the verification traffic does not
/// interfere with the locks under test.
#[repr(C, align(64))]
struct Object {
    tfrwl: TfRwLock,
    clhl: ClhLock,
    pfrwl: PfRwLock,
    tktl: TicketLock,
    rwl: RwLock,
    spl: SpinLock,
    count_rd: CacheAligned<AtomicU32>,
    count_wr: CacheAligned<AtomicU32>,
}

impl Object {
    fn new() -> Self {
        Self {
            tfrwl: TfRwLock::new(),
            clhl: ClhLock::new(),
            pfrwl: PfRwLock::new(),
            tktl: TicketLock::new(),
            rwl: RwLock::new(),
            spl: SpinLock::new(),
            count_rd: CacheAligned(AtomicU32::new(0)),
            count_wr: CacheAligned(AtomicU32::new(0)),
        }
    }
}

#[derive(Clone, Copy)]
struct Options {
    affinity: u64,
    numlaps: u32,
    numobjs: u32,
    numthreads: u32,
    verbose: bool,
    locktype: LockType,
}

struct Shared {
    objs: Vec<Object>,
    barrier: CacheAligned<AtomicU64>,
    /// Nanoseconds since `t0`, stored by the last worker to finish.
    end_ns: AtomicU64,
    quit: AtomicBool,
    t0: Instant,
    opts: Options,
}

#[derive(Default, Clone, Copy)]
struct WorkerStats {
    numfailrd: u32,
    numfailwr: u32,
    nummultrd: u32,
    numops: u32,
}

fn xorshift64star(state: &mut u64) -> u64 {
    // the state must be seeded with a nonzero value
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// Wait for my start bit.
fn barrier_thr_begin(barrier: &AtomicU64, tidx: u32) {
    let mask = 1u64 << tidx;
    wait_until(|| barrier.load(Ordering::Acquire) & mask != 0);
}

/// Signal I am done; the last thread out records the end time.
fn barrier_thr_done(sh: &Shared, tidx: u32) {
    let mask = 1u64 << tidx;
    let left = sh.barrier.fetch_and(!mask, Ordering::AcqRel) & !mask;
    if left == 0 {
        sh.end_ns
            .store(sh.t0.elapsed().as_nanos() as u64, Ordering::Release);
    }
}

fn thr_execute(sh: &Shared, tidx: u32) -> WorkerStats {
    let mut clhslot = ClhSlot::new();
    let mut tkt: u16 = 0;
    let mut stats = WorkerStats::default();
    let mut xor_state: u64 = tidx as u64 + 1;
    let locktype = sh.opts.locktype;
    let mut lap = 0;
    while lap < sh.opts.numlaps && !sh.quit.load(Ordering::Relaxed) {
        let idx = (xorshift64star(&mut xor_state) % sh.opts.numobjs as u64) as usize;
        let obj = &sh.objs[idx];
        if lap % 8 != 0 {
            // shared critical section: reader side where the lock has one
            match locktype {
                LockType::Plain => obj.spl.acquire(),
                LockType::Rw => obj.rwl.acquire_rd(),
                LockType::Tfrw => obj.tfrwl.acquire_rd(),
                LockType::Pfrw => obj.pfrwl.acquire_rd(),
                LockType::Clh => obj.clhl.acquire(&mut clhslot),
                LockType::Tkt => tkt = obj.tktl.acquire(),
            }
            if obj.count_wr.load(Ordering::Relaxed) != 0 {
                stats.numfailwr += 1;
            }
            if obj.count_rd.fetch_add(1, Ordering::Relaxed) != 0 {
                stats.nummultrd += 1;
            }
            delay_loop(10);
            obj.count_rd.fetch_sub(1, Ordering::Relaxed);
            if obj.count_wr.load(Ordering::Relaxed) != 0 {
                stats.numfailwr += 1;
            }
            match locktype {
                LockType::Plain => obj.spl.release(),
                LockType::Rw => obj.rwl.release_rd(),
                LockType::Tfrw => obj.tfrwl.release_rd(),
                LockType::Pfrw => obj.pfrwl.release_rd(),
                LockType::Clh => ClhLock::release(&mut clhslot),
                LockType::Tkt => obj.tktl.release(tkt),
            }
        } else {
            // exclusive critical section
            match locktype {
                LockType::Plain => obj.spl.acquire(),
                LockType::Rw => obj.rwl.acquire_wr(),
                LockType::Tfrw => tkt = obj.tfrwl.acquire_wr(),
                LockType::Pfrw => obj.pfrwl.acquire_wr(),
                LockType::Clh => obj.clhl.acquire(&mut clhslot),
                LockType::Tkt => tkt = obj.tktl.acquire(),
            }
            if obj.count_wr.fetch_add(1, Ordering::Relaxed) != 0 {
                stats.numfailwr += 1;
            }
            if obj.count_rd.load(Ordering::Relaxed) != 0 {
                stats.numfailrd += 1;
            }
            delay_loop(10);
            if obj.count_wr.fetch_sub(1, Ordering::Relaxed) != 1 {
                stats.numfailwr += 1;
            }
            if obj.count_rd.load(Ordering::Relaxed) != 0 {
                stats.numfailrd += 1;
            }
            match locktype {
                LockType::Plain => obj.spl.release(),
                LockType::Rw => obj.rwl.release_wr(),
                LockType::Tfrw => obj.tfrwl.release_wr(tkt),
                LockType::Pfrw => obj.pfrwl.release_wr(),
                LockType::Clh => ClhLock::release(&mut clhslot),
                LockType::Tkt => obj.tktl.release(tkt),
            }
        }
        delay_loop(10);
        lap += 1;
    }
    // first thread through the tape stops the others so the duration
    // reflects a full field
    sh.quit.store(true, Ordering::Relaxed);
    stats.numops = lap;
    stats
}

fn usage() -> ! {
    eprint!(
        "Usage: bm_lock [<options>] <locktype>\n\
         -a <binmask>     CPU affinity mask (default base 2)\n\
         -l <numlaps>     Number of laps\n\
         -o <numobjs>     Number of objects (locks)\n\
         -t <numthr>      Number of threads\n\
         -v               Verbose\n\
         Lock types: "
    );
    for (i, t) in LockType::ALL.iter().enumerate() {
        let sep = if i + 1 != LockType::ALL.len() { ' ' } else { '\n' };
        eprint!("{}{}", t.abbr(), sep);
    }
    process::exit(1);
}

fn parse_args() -> Options {
    let mut affinity = u64::MAX;
    let mut numlaps: u32 = 1_000_000;
    let mut numobjs: u32 = 0;
    let mut numthreads: u32 = 2;
    let mut verbose = false;
    let mut locktype = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-a" => {
                let v = args.next().unwrap_or_else(|| usage());
                let parsed = if let Some(hex) = v.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                } else {
                    u64::from_str_radix(&v, 2)
                };
                match parsed {
                    Ok(m) => affinity = m,
                    Err(_) => usage(),
                }
            }
            "-l" => {
                let n: i64 = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if n < 1 || n > u32::MAX as i64 {
                    eprintln!("Invalid number of laps {n}");
                    process::exit(1);
                }
                numlaps = n as u32;
            }
            "-o" => {
                let n: i64 = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if n < 1 || n > u32::MAX as i64 {
                    eprintln!("Invalid number of objects {n}");
                    process::exit(1);
                }
                numobjs = n as u32;
            }
            "-t" => {
                let n: i64 = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if n < 1 || n > MAXTHREADS as i64 {
                    eprintln!("Invalid number of threads {n}");
                    process::exit(1);
                }
                numthreads = n as u32;
            }
            "-v" => verbose = true,
            s if !s.starts_with('-') => {
                if locktype.is_some() {
                    usage();
                }
                match LockType::from_abbr(s) {
                    Some(t) => locktype = Some(t),
                    None => usage(),
                }
            }
            _ => usage(),
        }
    }
    let locktype = locktype.unwrap_or_else(|| usage());
    if numobjs == 0 {
        numobjs = if numthreads >= 2 { numthreads / 2 } else { 1 };
    }
    Options {
        affinity,
        numlaps,
        numobjs,
        numthreads,
        verbose,
        locktype,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let opts = parse_args();
    init_tracing(opts.verbose);

    println!(
        "{} {} lock{}, {} laps, {} thread{}, affinity mask={:#x}",
        opts.numobjs,
        opts.locktype.long_name(),
        if opts.numobjs != 1 { "s" } else { "" },
        opts.numlaps,
        opts.numthreads,
        if opts.numthreads != 1 { "s" } else { "" },
        opts.affinity
    );

    let shared = Arc::new(Shared {
        objs: (0..opts.numobjs).map(|_| Object::new()).collect(),
        barrier: CacheAligned(AtomicU64::new(0)),
        end_ns: AtomicU64::new(0),
        quit: AtomicBool::new(false),
        t0: Instant::now(),
        opts,
    });

    // hand out CPUs from the affinity mask, lowest set bit first
    let mut affinity = opts.affinity;
    let mut cpus: Vec<Option<u32>> = Vec::with_capacity(opts.numthreads as usize);
    for thr in 0..opts.numthreads {
        if affinity != 0 {
            let cpu = affinity.trailing_zeros();
            affinity &= !(1u64 << cpu);
            if opts.verbose {
                println!("Thread {thr} on CPU {cpu}");
            }
            cpus.push(Some(cpu));
        } else {
            cpus.push(None);
        }
    }

    let mut handles = Vec::with_capacity(opts.numthreads as usize);
    for tidx in 0..opts.numthreads {
        let sh = Arc::clone(&shared);
        let cpu = cpus[tidx as usize];
        let h = thread::Builder::new()
            .name(format!("worker-{tidx}"))
            .spawn(move || {
                if let Some(cpu) = cpu {
                    if let Err(e) = os::pin_current_thread(cpu as usize) {
                        eprintln!("pin thread {tidx} to CPU {cpu}: {e}");
                        process::exit(1);
                    }
                }
                if let Err(e) = os::set_fifo_sched(PRIO) {
                    // SCHED_FIFO usually needs privileges; run with the
                    // default policy when the OS says no
                    tracing::debug!(tidx, error = %e, "SCHED_FIFO refused, using default policy");
                }
                barrier_thr_begin(&sh.barrier, tidx);
                let stats = thr_execute(&sh, tidx);
                barrier_thr_done(&sh, tidx);
                stats
            })
            .expect("spawn worker");
        handles.push(h);
    }

    // release the field and wait for the last one home
    let start_ns = shared.t0.elapsed().as_nanos() as u64;
    let all = if opts.numthreads == MAXTHREADS {
        u64::MAX
    } else {
        (1u64 << opts.numthreads) - 1
    };
    shared.barrier.store(all, Ordering::Release);
    wait_until(|| shared.barrier.load(Ordering::Acquire) == 0);
    wait_until(|| shared.end_ns.load(Ordering::Acquire) != 0);
    let elapsed_ns = shared.end_ns.load(Ordering::Relaxed) - start_ns;

    let stats: Vec<WorkerStats> = handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect();

    if opts.affinity != 0 {
        let freqs: Vec<u64> = cpus
            .iter()
            .flatten()
            .filter_map(|&c| os::cpu_freq_khz(c as usize))
            .collect();
        if !freqs.is_empty() {
            let avg = freqs.iter().sum::<u64>() / freqs.len() as u64;
            if avg != 0 {
                println!("Average CPU frequency {avg}kHz");
            }
        }
    }

    let mut totalops: u64 = 0;
    for (t, st) in stats.iter().enumerate() {
        println!(
            "{}: numfailrd {}, numfailwr {}, nummultrd {}, numops {}",
            t, st.numfailrd, st.numfailwr, st.nummultrd, st.numops
        );
        totalops += st.numops as u64;
    }

    println!(
        "Duration: {}.{:04} seconds",
        elapsed_ns / 1_000_000_000,
        (elapsed_ns % 1_000_000_000) / 100_000
    );

    let mut fairness: f32 = 1.0;
    for st in &stats {
        if st.numops < opts.numlaps {
            fairness *= st.numops as f32 / opts.numlaps as f32;
        } else if st.numops > opts.numlaps {
            fairness *= opts.numlaps as f32 / st.numops as f32;
        }
    }
    fairness = fairness.powf(1.0 / opts.numthreads as f32);
    println!("Fairness: {fairness:.6}");

    if elapsed_ns != 0 {
        print!(
            "{} lock ops/second",
            (1_000_000_000u64 * totalops / elapsed_ns) as u32
        );
    }
    if totalops != 0 {
        println!(", {} nanoseconds/lock op", (elapsed_ns / totalops) as u32);
    }
}
