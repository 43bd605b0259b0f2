use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Remote image builds and build status publishing
#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    about = "Remote image builds and build status publishing",
    version,
    author,
    long_about = "kiln assembles BuildKit solve requests for image builds and publishes \
                  ImageBuild phase transitions to a message broker exactly once each."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short = 'c',
        long,
        global = true,
        value_name = "FILE",
        help = "Configuration file (.yaml, .yml or .json)"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Verbose output")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Assemble a build and print its solve request",
        long_about = "Fetches the build context and assembles the solve request exactly as a \
                      real build would, then prints it as JSON instead of submitting it.\n\n\
                      Examples:\n  \
                      kiln plan --context ./app.tar.gz --image reg.example.com/ns/app:v1\n  \
                      kiln plan --context https://ctx.example.com/app.tgz --image myrepo/app \
                      --build-arg VERSION=1.2 --no-cache-import"
    )]
    Plan(PlanArgs),

    #[command(
        about = "Assemble a cache-priming solve and print it",
        long_about = "Prints the solve request that would pull IMAGE into the daemon's cache.\n\n\
                      Examples:\n  \
                      kiln cache --image golang:1.22"
    )]
    Cache(CacheArgs),

    #[command(
        about = "Publish pending phase transitions of an ImageBuild",
        long_about = "Publishes every unprocessed transition of the ImageBuild stored in FILE \
                      and marks each processed in place. Broker settings come from the \
                      messaging section of the configuration; only file:// broker URLs are \
                      supported.\n\n\
                      Examples:\n  \
                      kiln --config kiln.yaml publish --object imagebuild.json"
    )]
    Publish(PublishArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[arg(long, value_name = "SOURCE", help = "Context archive URL or path")]
    pub context: String,

    #[arg(
        short = 'i',
        long = "image",
        value_name = "REF",
        required = true,
        help = "Image to push (repeatable)"
    )]
    pub images: Vec<String>,

    #[arg(long = "build-arg", value_name = "KEY=VALUE", help = "Build argument (repeatable)")]
    pub build_args: Vec<String>,

    #[arg(long, help = "Do not export inline cache")]
    pub no_cache_export: bool,

    #[arg(long, help = "Do not import registry cache")]
    pub no_cache_import: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    #[arg(short = 'i', long, value_name = "REF", help = "Image to pull into the cache")]
    pub image: String,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[arg(long, value_name = "FILE", help = "ImageBuild JSON document")]
    pub object: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_args_verify() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_plan_args() {
        let args = CliArgs::parse_from([
            "kiln",
            "plan",
            "--context",
            "./ctx.tgz",
            "--image",
            "myrepo/app:v1",
            "-i",
            "myrepo/app:latest",
            "--build-arg",
            "A=1",
            "--no-cache-import",
        ]);

        match args.command {
            Commands::Plan(plan) => {
                assert_eq!(plan.context, "./ctx.tgz");
                assert_eq!(plan.images, vec!["myrepo/app:v1", "myrepo/app:latest"]);
                assert_eq!(plan.build_args, vec!["A=1"]);
                assert!(!plan.no_cache_export);
                assert!(plan.no_cache_import);
            }
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_plan_requires_image() {
        assert!(CliArgs::try_parse_from(["kiln", "plan", "--context", "x"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from([
            "kiln",
            "publish",
            "--object",
            "build.json",
            "--config",
            "kiln.yaml",
            "--quiet",
        ]);

        assert!(args.quiet);
        assert_eq!(args.config, Some(PathBuf::from("kiln.yaml")));
        assert!(matches!(args.command, Commands::Publish(_)));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(CliArgs::try_parse_from(["kiln", "-q", "-v", "cache", "--image", "a"]).is_err());
    }
}
