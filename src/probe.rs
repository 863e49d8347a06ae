//! Self-check of an allocation path.
//!
//! Runs the allocator contract against a live zone, either through a dispatch
//! chain or through the zone's own (possibly intercepted) table, and reports
//! every property that does not hold.

use std::{
    fmt::{self, Display, Formatter},
    ptr, thread,
};

use libc::c_void;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

use crate::{dispatch::AllocatorDispatch, zone::Zone};

/// The allocation surface under test.
///
/// # Safety
///
/// Implementations must behave like a native allocator: pointers they return
/// are live until freed through the same target.
pub unsafe trait ProbeTarget: Sync {
    fn describe(&self) -> String;
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    unsafe fn calloc(&self, n: usize, size: usize) -> *mut c_void;
    unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut c_void;
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;
    unsafe fn free(&self, ptr: *mut c_void);
    unsafe fn size(&self, ptr: *mut c_void) -> usize;
    unsafe fn batch_malloc(&self, size: usize, results: &mut [*mut c_void]) -> usize;
    unsafe fn batch_free(&self, pointers: &[*mut c_void]);
}

/// A dispatch node and the zone to dispatch for.
pub struct ChainTarget {
    pub dispatch: &'static AllocatorDispatch,
    pub zone: Zone,
}

unsafe impl ProbeTarget for ChainTarget {
    fn describe(&self) -> String {
        format!(
            "chain -> {}",
            self.zone.name().unwrap_or("unnamed zone")
        )
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        self.dispatch.alloc(size, self.zone)
    }

    unsafe fn calloc(&self, n: usize, size: usize) -> *mut c_void {
        self.dispatch.alloc_zero_initialized(n, size, self.zone)
    }

    unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut c_void {
        self.dispatch.alloc_aligned(alignment, size, self.zone)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        self.dispatch.realloc(ptr, size, self.zone)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        self.dispatch.free(ptr, self.zone)
    }

    unsafe fn size(&self, ptr: *mut c_void) -> usize {
        self.dispatch.get_size_estimate(ptr, self.zone)
    }

    unsafe fn batch_malloc(&self, size: usize, results: &mut [*mut c_void]) -> usize {
        self.dispatch.batch_malloc(size, results, self.zone)
    }

    unsafe fn batch_free(&self, pointers: &[*mut c_void]) {
        self.dispatch.batch_free(pointers, self.zone)
    }
}

unsafe impl ProbeTarget for Zone {
    fn describe(&self) -> String {
        format!("zone table of {}", self.name().unwrap_or("unnamed zone"))
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        Zone::malloc(*self, size)
    }

    unsafe fn calloc(&self, n: usize, size: usize) -> *mut c_void {
        Zone::calloc(*self, n, size)
    }

    unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut c_void {
        Zone::memalign(*self, alignment, size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        Zone::realloc(*self, ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        Zone::free(*self, ptr)
    }

    unsafe fn size(&self, ptr: *mut c_void) -> usize {
        Zone::size(*self, ptr)
    }

    unsafe fn batch_malloc(&self, size: usize, results: &mut [*mut c_void]) -> usize {
        Zone::batch_malloc(*self, size, results)
    }

    unsafe fn batch_free(&self, pointers: &[*mut c_void]) {
        Zone::batch_free(*self, pointers)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub sizes: Vec<usize>,
    pub alignments: Vec<usize>,
    /// Pointers requested per batch allocation.
    pub batch: usize,
    pub batch_size: usize,
    pub threads: usize,
    /// Allocations per thread in the concurrent churn.
    pub iterations: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            sizes: vec![0, 1, 64, 4096, 1 << 20],
            alignments: vec![16, 64, 4096],
            batch: 32,
            batch_size: 48,
            threads: 4,
            iterations: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeReport {
    pub target: String,
    pub checks: Vec<CheckOutcome>,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

impl Display for ProbeReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        writeln!(f, "{}", self.target)?;
        for check in self.checks.iter() {
            writeln!(
                f,
                " {} {}: {}",
                if check.passed { "ok  " } else { "FAIL" },
                check.name,
                check.detail
            )?;
        }
        let failed = self.failures().count();
        write!(
            f,
            "{} checks, {} failed",
            self.checks.len(),
            failed
        )
    }
}

fn bytes(n: usize) -> String {
    format!("{}B", n.to_formatted_string(&Locale::en))
}

struct Checks {
    outcomes: Vec<CheckOutcome>,
}

impl Checks {
    fn record(&mut self, name: &str, result: Result<String, String>) {
        let (passed, detail) = match result {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        self.outcomes.push(CheckOutcome {
            name: name.to_string(),
            passed,
            detail,
        });
    }
}

/// Runs every check against `target`.
///
/// # Safety
///
/// `target` must be usable from several threads at once, and its zone must be
/// registered if it dispatches.
pub unsafe fn run<T: ProbeTarget>(target: &T, config: &ProbeConfig) -> ProbeReport {
    let mut checks = Checks {
        outcomes: Vec::new(),
    };
    checks.record("size estimate", size_estimate(target, &config.sizes));
    checks.record("round trip", round_trip(target, &config.sizes));
    checks.record("realloc", realloc_preserves(target));
    checks.record("calloc", calloc_zeroes(target, &config.sizes));
    checks.record("memalign", memalign_aligns(target, &config.alignments));
    checks.record("batch", batch(target, config.batch_size, config.batch));
    checks.record("free null", free_null(target));
    checks.record(
        "concurrent churn",
        churn(target, config.threads, config.iterations),
    );
    ProbeReport {
        target: target.describe(),
        checks: checks.outcomes,
    }
}

unsafe fn size_estimate<T: ProbeTarget>(target: &T, sizes: &[usize]) -> Result<String, String> {
    let mut largest_slack = 0;
    for &size in sizes {
        let ptr = target.malloc(size);
        if ptr.is_null() {
            return Err(format!("malloc({}) failed", bytes(size)));
        }
        let estimate = target.size(ptr);
        target.free(ptr);
        if estimate < size {
            return Err(format!(
                "size estimate {} below request {}",
                bytes(estimate),
                bytes(size)
            ));
        }
        largest_slack = largest_slack.max(estimate - size);
    }
    Ok(format!("largest slack {}", bytes(largest_slack)))
}

unsafe fn round_trip<T: ProbeTarget>(target: &T, sizes: &[usize]) -> Result<String, String> {
    const SENTINEL: usize = 256;
    let sentinel = target.malloc(SENTINEL) as *mut u8;
    if sentinel.is_null() {
        return Err("sentinel allocation failed".to_string());
    }
    ptr::write_bytes(sentinel, 0xA5, SENTINEL);
    for &size in sizes {
        for _ in 0..4 {
            let ptr = target.malloc(size) as *mut u8;
            if ptr.is_null() {
                target.free(sentinel as *mut c_void);
                return Err(format!("malloc({}) failed", bytes(size)));
            }
            if size > 0 {
                ptr::write_bytes(ptr, 0x5A, size);
            }
            target.free(ptr as *mut c_void);
        }
    }
    let intact = (0..SENTINEL).all(|i| *sentinel.add(i) == 0xA5);
    target.free(sentinel as *mut c_void);
    if intact {
        Ok(format!("{} sizes", sizes.len()))
    } else {
        Err("sentinel allocation was overwritten".to_string())
    }
}

unsafe fn realloc_preserves<T: ProbeTarget>(target: &T) -> Result<String, String> {
    let ptr = target.malloc(16) as *mut u8;
    if ptr.is_null() {
        return Err("malloc(16B) failed".to_string());
    }
    for i in 0..16 {
        *ptr.add(i) = i as u8 ^ 0x3C;
    }
    let grown = target.realloc(ptr as *mut c_void, 4096) as *mut u8;
    if grown.is_null() {
        target.free(ptr as *mut c_void);
        return Err("realloc to 4,096B failed".to_string());
    }
    let preserved = (0..16).all(|i| *grown.add(i) == i as u8 ^ 0x3C);
    let moved = grown != ptr;
    target.free(grown as *mut c_void);
    if preserved {
        Ok(if moved { "moved" } else { "in place" }.to_string())
    } else {
        Err("first 16B changed".to_string())
    }
}

unsafe fn calloc_zeroes<T: ProbeTarget>(target: &T, sizes: &[usize]) -> Result<String, String> {
    for &size in sizes.iter().filter(|&&s| s > 0) {
        // Dirty the heap first so zeroing is observable.
        let dirty = target.malloc(size) as *mut u8;
        if !dirty.is_null() {
            ptr::write_bytes(dirty, 0xFF, size);
            target.free(dirty as *mut c_void);
        }
        let ptr = target.calloc(1, size) as *const u8;
        if ptr.is_null() {
            return Err(format!("calloc(1, {}) failed", bytes(size)));
        }
        let zeroed = (0..size).all(|i| *ptr.add(i) == 0);
        target.free(ptr as *mut c_void);
        if !zeroed {
            return Err(format!("calloc(1, {}) returned dirty memory", bytes(size)));
        }
    }
    Ok("zeroed".to_string())
}

unsafe fn memalign_aligns<T: ProbeTarget>(target: &T, alignments: &[usize]) -> Result<String, String> {
    for &alignment in alignments {
        let ptr = target.memalign(alignment, 100);
        if ptr.is_null() {
            return Err(format!("memalign({}) failed", alignment));
        }
        let aligned = ptr as usize % alignment == 0;
        target.free(ptr);
        if !aligned {
            return Err(format!("{:p} is not {}-aligned", ptr, alignment));
        }
    }
    Ok(format!("{} alignments", alignments.len()))
}

unsafe fn batch<T: ProbeTarget>(target: &T, size: usize, count: usize) -> Result<String, String> {
    let mut results = vec![ptr::null_mut(); count];
    let allocated = target.batch_malloc(size, &mut results);
    if allocated > count {
        return Err(format!("{} pointers reported for {} requested", allocated, count));
    }
    let granted = &results[..allocated];
    if granted.iter().any(|p| p.is_null()) {
        target.batch_free(granted);
        return Err("batch returned a null pointer within its count".to_string());
    }
    let mut ranges: Vec<(usize, usize)> = granted
        .iter()
        .map(|&p| (p as usize, target.size(p).max(size)))
        .collect();
    ranges.sort_unstable();
    let overlap = ranges.windows(2).any(|w| w[0].0 + w[0].1 > w[1].0);
    target.batch_free(granted);
    if overlap {
        return Err("batch allocations overlap".to_string());
    }
    Ok(format!("{} of {} x {}", allocated, count, bytes(size)))
}

unsafe fn free_null<T: ProbeTarget>(target: &T) -> Result<String, String> {
    target.free(ptr::null_mut());
    match target.size(ptr::null_mut()) {
        0 => Ok("no-op".to_string()),
        n => Err(format!("size(null) reported {}", bytes(n))),
    }
}

unsafe fn churn<T: ProbeTarget>(target: &T, threads: usize, iterations: usize) -> Result<String, String> {
    let corrupted = thread::scope(|s| {
        let workers: Vec<_> = (0..threads)
            .map(|id| {
                s.spawn(move || {
                    let tag = id as u8 ^ 0xC3;
                    let mut live: Vec<(usize, usize)> = Vec::with_capacity(64);
                    let mut corrupted = 0;
                    for i in 0..iterations {
                        let size = 8 + (i * 37 + id * 11) % 1024;
                        let ptr = target.malloc(size) as *mut u8;
                        if ptr.is_null() {
                            continue;
                        }
                        ptr::write_bytes(ptr, tag, size);
                        live.push((ptr as usize, size));
                        if live.len() == 64 {
                            for (addr, size) in live.drain(..) {
                                let ptr = addr as *mut u8;
                                if (0..size).any(|j| *ptr.add(j) != tag) {
                                    corrupted += 1;
                                }
                                target.free(ptr as *mut c_void);
                            }
                        }
                    }
                    for (addr, _) in live.drain(..) {
                        target.free(addr as *mut c_void);
                    }
                    corrupted
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or(usize::MAX))
            .fold(0usize, |acc, n| acc.saturating_add(n))
    });
    if corrupted == 0 {
        Ok(format!("{} threads x {} allocations", threads, iterations))
    } else {
        Err(format!("{} blocks changed under their owner", corrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intercept::intercept_zone,
        native::{page_size, HeapZone, NativeHeap},
        registry::registry,
        terminal::DEFAULT_DISPATCH,
    };

    fn small_config() -> ProbeConfig {
        ProbeConfig {
            threads: 2,
            iterations: 1_000,
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn chain_target_passes() {
        let zone = HeapZone::new(b"probe-chain\0", NativeHeap::LINKED).leak();
        registry().register_zone(zone);
        let target = ChainTarget {
            dispatch: &DEFAULT_DISPATCH,
            zone,
        };
        let report = unsafe { run(&target, &small_config()) };
        assert!(report.passed(), "{}", report);
        assert_eq!(report.checks.len(), 8);
    }

    #[test]
    fn intercepted_zone_passes() {
        let zone = HeapZone::new(b"probe-zone\0", NativeHeap::LINKED).leak();
        unsafe { intercept_zone(zone) }.unwrap();
        let report = unsafe { run(&zone, &small_config()) };
        assert!(report.passed(), "{}", report);
        assert_eq!(report.target, "zone table of probe-zone");
    }

    #[test]
    fn old_zone_serves_alignments_up_to_a_page() {
        let zone = HeapZone::new(b"probe-v4\0", NativeHeap::LINKED)
            .with_version(4)
            .leak();
        registry().register_zone(zone);
        let target = ChainTarget {
            dispatch: &DEFAULT_DISPATCH,
            zone,
        };
        let report = unsafe { run(&target, &small_config()) };
        assert!(report.passed(), "{}", report);

        let config = ProbeConfig {
            alignments: vec![2 * page_size()],
            ..small_config()
        };
        let report = unsafe { run(&target, &config) };
        let failed: Vec<&str> = report.failures().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec!["memalign"]);
    }

    #[test]
    fn report_formats() {
        let report = ProbeReport {
            target: "chain -> test".to_string(),
            checks: vec![
                CheckOutcome {
                    name: "size estimate".to_string(),
                    passed: true,
                    detail: format!("largest slack {}", bytes(1 << 20)),
                },
                CheckOutcome {
                    name: "batch".to_string(),
                    passed: false,
                    detail: "batch allocations overlap".to_string(),
                },
            ],
        };
        assert_eq!(
            report.to_string(),
            "chain -> test\n ok   size estimate: largest slack 1,048,576B\n FAIL batch: batch allocations overlap\n2 checks, 1 failed"
        );

        let yaml = serde_yaml::to_string(&report).unwrap();
        let parsed: ProbeReport = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.checks, report.checks);
    }
}
