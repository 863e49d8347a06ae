use anyhow::{anyhow, bail, Context};
use args::Args;
use getopts::Occur;
use log::info;
use zone_shim::{
    chain, intercept_zone,
    probe::{self, ChainTarget, ProbeConfig, ProbeReport},
    registry, HeapZone, NativeHeap, Zone,
};

const PROGRAM_DESC: &str = "Check an allocation path through the zone_shim dispatch chain";
const PROGRAM_NAME: &str = "zs_probe";

fn parse_list(list: &str) -> Result<Vec<usize>, anyhow::Error> {
    list.split(',')
        .map(|item| {
            item.trim()
                .parse::<usize>()
                .map_err(|e| anyhow!("invalid number '{}': {}", item, e))
        })
        .collect()
}

#[cfg(target_os = "macos")]
fn platform_zone() -> Result<Zone, anyhow::Error> {
    Ok(zone_shim::native::darwin::default_zone())
}

#[cfg(not(target_os = "macos"))]
fn platform_zone() -> Result<Zone, anyhow::Error> {
    bail!("--platform-zone needs a platform allocator organized in zones")
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.flag("h", "help", "Print the usage menu");
    args.flag(
        "i",
        "intercept",
        "Intercept the zone and call its own table instead of the chain",
    );
    args.flag(
        "p",
        "platform-zone",
        "Use the platform's default malloc zone instead of a private one",
    );
    args.option(
        "s",
        "sizes",
        "Comma-separated allocation sizes",
        "SIZES",
        Occur::Optional,
        None,
    );
    args.option(
        "a",
        "alignments",
        "Comma-separated memalign alignments",
        "ALIGNMENTS",
        Occur::Optional,
        None,
    );
    args.option(
        "b",
        "batch",
        "Pointers requested per batch allocation",
        "COUNT",
        Occur::Optional,
        None,
    );
    args.option(
        "t",
        "threads",
        "Threads in the concurrent churn",
        "THREADS",
        Occur::Optional,
        None,
    );
    args.option(
        "f",
        "format",
        "Report format: text or yaml",
        "FORMAT",
        Occur::Optional,
        Some("text".to_string()),
    );

    args.parse_from_cli()?;

    if args.value_of::<bool>("help")? {
        println!("{}", args.full_usage());
        return Ok(());
    }

    let mut config = ProbeConfig::default();
    if let Some(sizes) = args.optional_value_of::<String>("sizes")? {
        config.sizes = parse_list(&sizes)?;
    }
    if let Some(alignments) = args.optional_value_of::<String>("alignments")? {
        config.alignments = parse_list(&alignments)?;
    }
    if let Some(batch) = args.optional_value_of::<usize>("batch")? {
        config.batch = batch;
    }
    if let Some(threads) = args.optional_value_of::<usize>("threads")? {
        config.threads = threads;
    }
    let format: String = args.value_of("format")?;
    if format != "text" && format != "yaml" {
        bail!("unknown report format '{}'", format);
    }

    let zone = if args.value_of::<bool>("platform-zone")? {
        platform_zone()?
    } else {
        HeapZone::new(b"zs_probe\0", NativeHeap::LINKED).leak()
    };
    let report: ProbeReport = if args.value_of::<bool>("intercept")? {
        unsafe { intercept_zone(zone) }.context("failed to intercept probe zone")?;
        info!("probing intercepted zone");
        unsafe { probe::run(&zone, &config) }
    } else {
        registry()
            .try_register(zone)
            .context("failed to register probe zone")?;
        let target = ChainTarget {
            dispatch: chain().head(),
            zone,
        };
        info!("probing {} chain layers", chain().layers().count());
        unsafe { probe::run(&target, &config) }
    };

    if format == "yaml" {
        print!(
            "{}",
            serde_yaml::to_string(&report).context("failed to convert report to YAML")?
        );
    } else {
        println!("{}", report);
    }

    if !report.passed() {
        bail!("{} checks failed", report.failures().count());
    }
    Ok(())
}
