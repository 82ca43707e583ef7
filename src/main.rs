use anyhow::{Context, Result};
use clap::Parser;
use modperf::cli::{Cli, OutputFormat};
use modperf::module::{CallSite, MethodDescriptor, ModuleDescriptor, TypeDescriptor};
use modperf::registry::{ExtensionInfo, ExtensionRegistry};
use modperf::reporter::{FrameCounter, Report, Reporter};
use modperf::synth::ModuleBinary;
use modperf::{DiagnosticsSnapshot, InterceptionController, MonitorConfig};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const FRAME: Duration = Duration::from_millis(16);

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Spin for `micros` of CPU time
fn burn(micros: u64) {
    let until = Instant::now() + Duration::from_micros(micros);
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

/// Modules of the simulated host, their binaries written under `dir`
struct SimulatedHost {
    dir: PathBuf,
    monitor: ModuleDescriptor,
    loaded: Vec<ModuleDescriptor>,
    /// Loaded halfway through the run
    late: ModuleDescriptor,
}

impl SimulatedHost {
    fn build(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let monitor = Self::module(
            &dir,
            "modperf",
            ModuleBinary::new()
                .function("Monitor::update", 64)
                .function("Monitor::report", 64)
                .function("Monitor::create_ui", 64),
            vec![TypeDescriptor::new("Monitor")
                .extends("ModBehaviour")
                .with_methods(["update", "report", "create_ui"])],
        )?;

        let weather = Self::module(
            &dir,
            "weather",
            ModuleBinary::new()
                .function_calling("WeatherMod::update", 96, &["Cloud::drift"])
                .function_calling("WeatherMod::on_enable", 32, &["Harmony::Patch"])
                .function("WeatherMod::name", 4)
                .function("Cloud::drift", 48),
            vec![
                TypeDescriptor::new("WeatherMod")
                    .extends("ModBehaviour")
                    .with_methods(["update", "on_enable", "name"]),
                TypeDescriptor::new("Cloud").with_methods(["drift"]),
            ],
        )?;

        let minimap = Self::module(
            &dir,
            "minimap",
            ModuleBinary::new()
                .function("Minimap::update", 64)
                .function("Minimap::render", 128),
            vec![TypeDescriptor::new("Minimap")
                .extends("ModBehaviour")
                .with_methods(["update", "render"])],
        )?;

        let autoloot = Self::module(
            &dir,
            "autoloot",
            ModuleBinary::new()
                .function_calling("AutoLoot::update", 80, &["AutoLoot::scan"])
                .function_calling("AutoLoot::scan", 64, &["AutoLoot::scan"]),
            vec![TypeDescriptor::new("AutoLoot")
                .extends("ModBehaviour")
                .with_methods(["update", "scan"])],
        )?;

        // Patching code only: nothing here may be hooked
        let patcher = Self::module(
            &dir,
            "timescale",
            ModuleBinary::new()
                .function_calling("TimeScale::on_enable", 40, &["Harmony::Patch"])
                .function("TimeScalePatch::Prefix", 32),
            vec![
                TypeDescriptor::new("TimeScale")
                    .extends("ModBehaviour")
                    .with_methods(["on_enable"]),
                TypeDescriptor::new("TimeScalePatch")
                    .with_attribute("HarmonyPatch")
                    .with_method(MethodDescriptor::new("Prefix").with_attribute("HarmonyPrefix")),
            ],
        )?;

        // A shared library, not an extension
        let corelib = Self::module(
            &dir,
            "corelib",
            ModuleBinary::new().function("Json::parse", 256),
            vec![TypeDescriptor::new("Json").with_methods(["parse"])],
        )?;

        let late = Self::module(
            &dir,
            "photomode",
            ModuleBinary::new().function("PhotoMode::update", 64),
            vec![TypeDescriptor::new("PhotoMode")
                .extends("ModBehaviour")
                .with_methods(["update"])],
        )?;

        let loaded = vec![monitor.clone(), weather, minimap, autoloot, patcher, corelib];
        Ok(Self {
            dir,
            monitor,
            loaded,
            late,
        })
    }

    fn module(
        dir: &Path,
        name: &str,
        binary: ModuleBinary,
        types: Vec<TypeDescriptor>,
    ) -> Result<ModuleDescriptor> {
        let path = dir.join(format!("{}.o", name));
        binary.write_to(&path)?;
        Ok(types
            .into_iter()
            .fold(ModuleDescriptor::from_binary(&path, name), |m, ty| {
                m.with_type(ty)
            }))
    }

    fn loaded(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.loaded.iter().find(|m| m.id.short_name() == name)
    }

    fn site(&self, module: &str, type_name: &str, method: &str) -> CallSite {
        match self.loaded(module) {
            Some(m) => m.call_site(type_name, method),
            None => CallSite::detached(type_name, method),
        }
    }

    fn default_registry(&self) -> ExtensionRegistry {
        let registry = ExtensionRegistry::new();
        for (module, display_name) in [
            ("weather", "Better Weather"),
            ("minimap", "Tiny Map"),
            ("autoloot", "Auto Loot"),
        ] {
            if let Some(m) = self.loaded(module) {
                registry.register(ExtensionInfo {
                    display_name: display_name.to_string(),
                    binary_path: m.id.path().to_path_buf(),
                });
            }
        }
        registry.register(ExtensionInfo {
            display_name: "Photo Mode".to_string(),
            binary_path: self.late.id.path().to_path_buf(),
        });
        registry
    }
}

impl Drop for SimulatedHost {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn scan(controller: &InterceptionController, site: &CallSite, depth: u32) {
    controller.call(site, || {
        burn(40);
        if depth > 1 {
            scan(controller, site, depth - 1);
        }
    });
}

fn print_report(format: OutputFormat, report: &Report) {
    let mut out = std::io::stdout().lock();
    let _ = match format {
        OutputFormat::Text => writeln!(out, "{}", report),
        OutputFormat::Json => match serde_json::to_string(report) {
            Ok(line) => writeln!(out, "{}", line),
            Err(e) => writeln!(out, "{{\"error\":\"{}\"}}", e),
        },
    };
}

fn print_diagnostics(format: OutputFormat, diagnostics: &DiagnosticsSnapshot) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("=== Monitor diagnostics ===");
            println!("hooks installed:        {}", diagnostics.hooks_installed);
            println!("ineligible skipped:     {}", diagnostics.ineligible_skipped);
            println!("introspection failures: {}", diagnostics.introspection_failures);
            println!("installation failures:  {}", diagnostics.installation_failures);
            println!("timing mismatches:      {}", diagnostics.timing_mismatches);
            println!("teardown failures:      {}", diagnostics.teardown_failures);
        }
        OutputFormat::Json => {
            let value = serde_json::json!({ "diagnostics": diagnostics });
            println!("{}", serde_json::to_string(&value)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let mut config = match &args.config {
        Some(path) => MonitorConfig::from_toml(path)?,
        None => MonitorConfig::default(),
    };
    if let Some(flush_ms) = args.flush_ms {
        config.flush_interval_ms = flush_ms;
    }
    config.validate()?;

    let host = SimulatedHost::build(
        std::env::temp_dir().join(format!("modperf-demo-{}", std::process::id())),
    )?;
    let registry = match &args.registry {
        Some(path) => ExtensionRegistry::from_toml(path)?,
        None => host.default_registry(),
    };

    let controller = Arc::new(
        InterceptionController::new(config.clone()).with_self_module(host.monitor.id.clone()),
    );
    let installed = controller.initialize(&host.loaded);
    tracing::info!("Installed {} hooks", installed);

    let frames = Arc::new(FrameCounter::new());
    let reporter = Reporter::new(
        controller.reader_with_names(Arc::new(registry)),
        Arc::clone(&frames),
        controller.clock(),
        config.flush_interval(),
    );
    let report_site = host.monitor.call_site("Monitor", "report");
    let handle = {
        let controller = Arc::clone(&controller);
        let report_site = report_site.clone();
        let format = args.format;
        reporter.spawn(move |report: &Report| {
            controller.call(&report_site, || print_report(format, report));
        })?
    };

    let update = host.monitor.call_site("Monitor", "update");
    let weather_update = host.site("weather", "WeatherMod", "update");
    let weather_drift = host.site("weather", "Cloud", "drift");
    let weather_enable = host.site("weather", "WeatherMod", "on_enable");
    let minimap_update = host.site("minimap", "Minimap", "update");
    let minimap_render = host.site("minimap", "Minimap", "render");
    let autoloot_scan = host.site("autoloot", "AutoLoot", "scan");
    let photo_update = host.late.call_site("PhotoMode", "update");

    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);
    let halfway = Instant::now() + Duration::from_millis(args.duration_ms / 2);

    // Never hooked; calls through it are free
    controller.call(&weather_enable, || burn(50));

    thread::scope(|scope| {
        for _ in 1..args.threads.max(1) {
            scope.spawn(|| {
                while Instant::now() < deadline {
                    controller.call(&minimap_render, || burn(150));
                    scan(&controller, &autoloot_scan, 5);
                    thread::sleep(Duration::from_millis(2));
                }
            });
        }

        let mut activated = false;
        while Instant::now() < deadline {
            let frame_start = Instant::now();
            controller.call(&update, || frames.tick());

            controller.call(&weather_update, || {
                burn(200);
                controller.call(&weather_drift, || burn(100));
            });
            controller.call(&minimap_update, || burn(100));

            if !activated && Instant::now() >= halfway {
                controller.on_module_activated(&host.late);
                activated = true;
            }
            if activated {
                controller.call(&photo_update, || burn(250));
            }

            if let Some(rest) = FRAME.checked_sub(frame_start.elapsed()) {
                thread::sleep(rest);
            }
        }
    });

    if let Some(mut reporter) = handle.shutdown() {
        let report = controller.call(&report_site, || reporter.flush());
        print_report(args.format, &report);
    }

    if args.diagnostics {
        print_diagnostics(args.format, &controller.diagnostics())?;
    }
    controller.cleanup();
    Ok(())
}
