/// Umbra CLI — Load Libraries, Bind Modules, Run
///
/// The binary consumes pre-compiled libraries: it loads them into the
/// module loader, runs the one-time binding pass, resolves the entry
/// binding in the requested module and drives a fresh process until idle.

use clap::{Parser, Subcommand};
use miette::{miette, IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use umbra::bind;
use umbra::errors::RuntimeError;
use umbra::species;
use umbra::{Family, Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "umbra", about = "The umbra language runtime", version)]
struct Cli {
    /// Log interpreter and gc activity (overridden by UMBRA_LOG).
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the entry point of a module from the given libraries.
    Run {
        /// Library files to load, in order.
        libraries: Vec<String>,

        /// Path of the module whose entry point to run.
        #[arg(long, default_value = ":main")]
        module: String,

        /// Name of the entry binding inside the module.
        #[arg(long, default_value = "main")]
        entry: String,

        /// Semispace size in bytes.
        #[arg(long, default_value_t = 2 * 1024 * 1024)]
        semispace_size: usize,

        /// Simulate an allocation failure on average every N allocations.
        #[arg(long, default_value_t = 0)]
        gc_fuzz_freq: usize,

        /// Seed for the allocation fuzzer.
        #[arg(long, default_value_t = 0x5ca1e)]
        gc_fuzz_seed: u64,

        /// Seed for the runtime's pseudo-random generator.
        #[arg(long, default_value_t = 0x5eed)]
        random_seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.trace { "umbra=debug" } else { "umbra=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("UMBRA_LOG")
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Command::Run {
            libraries,
            module,
            entry,
            semispace_size,
            gc_fuzz_freq,
            gc_fuzz_seed,
            random_seed,
        } => {
            if libraries.is_empty() {
                return Err(miette!("no libraries given"));
            }
            let config = RuntimeConfig {
                semispace_size_bytes: semispace_size,
                gc_fuzz_freq,
                gc_fuzz_seed,
                random_seed,
                ..Default::default()
            };
            let mut runtime = Runtime::new(config)
                .map_err(|c| RuntimeError::from_condition(c, None))
                .into_diagnostic()?;
            for library in &libraries {
                umbra::plankton::load_library_file(&mut runtime, library)
                    .map_err(|c| RuntimeError::from_condition(c, None))
                    .into_diagnostic()?;
            }
            bind::bind_modules(&mut runtime)
                .map_err(|c| RuntimeError::from_condition(c, None))
                .into_diagnostic()?;

            let code = resolve_entry(&mut runtime, &module, &entry)
                .map_err(|c| RuntimeError::from_condition(c, None))
                .into_diagnostic()?;
            let ambience = runtime
                .new_ambience()
                .map_err(|c| RuntimeError::from_condition(c, None))
                .into_diagnostic()?;
            match umbra::run_code_block(&mut runtime, ambience, code) {
                Ok(result) => {
                    println!("{}", species::value_to_string(result));
                    Ok(())
                }
                Err(condition) => {
                    let backtrace = runtime.last_backtrace.take();
                    Err(RuntimeError::from_condition(condition, backtrace)).into_diagnostic()
                }
            }
        }
    }
}

/// Looks up the entry code block: the binding for `entry` in the stage-0
/// fragment of `module`.
fn resolve_entry(
    runtime: &mut Runtime,
    module_path: &str,
    entry: &str,
) -> std::result::Result<umbra::Value, umbra::Condition> {
    let segments: Vec<&str> = module_path.split(':').filter(|s| !s.is_empty()).collect();
    let bound = runtime.roots.bound_module_map();
    let mut found = None;
    for (path, module) in umbra::maps::IdHashMapIter::new(bound) {
        if bind::path_to_string(path) == format!(":{}", segments.join(":")) {
            found = Some(module);
            break;
        }
    }
    let module = found.ok_or_else(umbra::Condition::not_found)?;
    let fragment = bind::get_module_fragment_at(module, 0)?;
    let (heap, roots) = runtime.heap_and_roots();
    let entry_path = bind::new_heap_path_with_names(heap, roots, &[entry])?;
    let code = bind::module_fragment_lookup_path_full(fragment, entry_path)?;
    if !species::in_family(Family::CodeBlock, code) {
        return Err(umbra::Condition::invalid_input());
    }
    Ok(code)
}
