use anyhow::Context;
use forkpool_core::FleetFile;

use crate::cli::CheckArgs;

pub async fn execute(args: CheckArgs) -> anyhow::Result<()> {
    let file = FleetFile::load(&args.file)
        .await
        .with_context(|| format!("invalid fleet file {}", args.file.display()))?;

    println!("✔ {} is valid", args.file.display());
    println!();
    match &file.script {
        Some(script) if file.args.is_empty() => println!("  Script:             {}", script),
        Some(script) => println!("  Script:             {} {}", script, file.args.join(" ")),
        None => println!("  Script:             (none, pass it on the command line)"),
    }
    if let Some(cwd) = &file.cwd {
        println!("  Dir:                {}", cwd.display());
    }
    let mut env: Vec<_> = file.env.keys().collect();
    env.sort();
    if !env.is_empty() {
        println!(
            "  Env:                {}",
            env.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    let options = &file.options;
    println!("  Workers:            {}", options.number);
    println!("  Strategy:           {}", options.strategy);
    println!("  Ready on:           {}", options.ready_on);
    if options.timeout.is_zero() {
        println!("  Timeout:            none");
    } else {
        println!("  Timeout:            {} ms", options.timeout.as_millis());
    }
    println!(
        "  Confirm delay:      {} ms",
        options.confirm_delay.as_millis()
    );
    println!(
        "  Disconnect timeout: {} ms",
        options.disconnect_timeout.as_millis()
    );
    println!(
        "  Backoff:            {} ms x{} (max {} ms)",
        file.backoff.start_ms, file.backoff.multiplier, file.backoff.max_ms
    );
    Ok(())
}
