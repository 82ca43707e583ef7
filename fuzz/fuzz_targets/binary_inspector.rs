#![no_main]

use libfuzzer_sys::fuzz_target;
use modperf::inspector::EligibilityInspector;
use modperf::MonitorConfig;

fuzz_target!(|data: &[u8]| {
    // Extension binaries come from disk as-is; a malformed one must be
    // rejected, never crash the host
    let inspector = EligibilityInspector::new(&MonitorConfig::default());
    let _ = inspector.inspect_bytes(data, "WeatherMod::update");
});
