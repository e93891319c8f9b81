//! namingctl configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default naming backend
    pub static DEFAULT_NAMING_URL: &str = "nats://127.0.0.1:4222/brpc";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "naming-worker";
    /// default log level. Can use this argument or NAMING_LOG env var
    pub const DEFAULT_NAMING_LOG: &str = "info";

    pub use clap::Parser;
    use clap::{Args, Subcommand};
    use naming::{DEFAULT_GROUP, DEFAULT_VERSION, Endpoint, NamingUrl, RegisterInfo, SubscribeInfo};

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "namingctl", bin_name = "namingctl", about, long_about = None)]
    /// parses from cli & environment var. namingctl will load `.env` from the working dir as well
    pub struct Config {
        /// naming backend, `nats://host:port[,host:port]/prefix?params` or `dns://name[:port]`
        #[clap(long, env, value_parser, default_value = DEFAULT_NAMING_URL)]
        pub naming_url: NamingUrl,
        /// number of tokio worker threads, defaults to the number of CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_NAMING_LOG)]
        pub naming_log: String,
        /// what to do
        #[clap(subcommand)]
        pub command: Command,
    }

    /// namingctl actions
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// announce an instance until interrupted, then withdraw it
        Register {
            #[clap(flatten)]
            target: ServiceArgs,
            /// address announced for the instance, `host:port`
            #[clap(long, short, value_parser)]
            endpoint: Endpoint,
        },
        /// print the current instances of a service
        Lookup {
            #[clap(flatten)]
            target: ServiceArgs,
        },
        /// print membership changes of a service until interrupted
        Watch {
            #[clap(flatten)]
            target: ServiceArgs,
        },
    }

    /// identifies a service
    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct ServiceArgs {
        /// service name
        #[clap(long, short, value_parser)]
        pub service: String,
        /// service group
        #[clap(long, value_parser, default_value = DEFAULT_GROUP)]
        pub group: String,
        /// service version
        #[clap(long, value_parser, default_value = DEFAULT_VERSION)]
        pub version: String,
        /// retry backend failures in the background instead of exiting
        #[clap(long)]
        pub ignore_failure: bool,
    }

    impl ServiceArgs {
        /// subscription target for these args
        pub fn subscribe_info(&self) -> SubscribeInfo {
            SubscribeInfo::new(self.service.as_str())
                .group(self.group.as_str())
                .version(self.version.as_str())
                .ignore_failure(self.ignore_failure)
        }

        /// instance of this service at `endpoint`
        pub fn register_info(&self, endpoint: &Endpoint) -> RegisterInfo {
            RegisterInfo::new(self.service.as_str(), endpoint.host(), endpoint.port())
                .group(self.group.as_str())
                .version(self.version.as_str())
                .ignore_failure(self.ignore_failure)
        }
    }

}

pub mod trace {
    //! tracing configuration
    use std::{fmt, str::FromStr};

    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self as layer,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Log output format, from the `LOG_FORMAT` env var
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum LogFormat {
        /// unstructured single-line logs
        #[default]
        Standard,
        /// one json object per event
        Json,
        /// multi-line human readable logs
        Pretty,
    }

    impl FromStr for LogFormat {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_lowercase().as_str() {
                "standard" => Ok(LogFormat::Standard),
                "json" => Ok(LogFormat::Json),
                "pretty" => Ok(LogFormat::Pretty),
                other => Err(format!(
                    "unknown log format '{other}', expected standard, json or pretty"
                )),
            }
        }
    }

    impl fmt::Display for LogFormat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                LogFormat::Standard => "standard",
                LogFormat::Json => "json",
                LogFormat::Pretty => "pretty",
            })
        }
    }

    /// Installed tracing configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting applied to logs
        pub log_format: LogFormat,
    }

    impl Config {
        /// Install the global subscriber. `naming_log` is an `EnvFilter`
        /// directive; an invalid one falls back to `info`.
        pub fn parse(naming_log: &str) -> Result<Self> {
            let log_format = env_parser::var_or("LOG_FORMAT", LogFormat::default())?;

            let filter = EnvFilter::try_new(naming_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("async_nats=warn".parse()?);

            match log_format {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(layer::layer().json())
                        .init();
                }
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            layer::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                LogFormat::Standard => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(layer::layer())
                        .init();
                }
            }

            Ok(Self { log_format })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_log_format_parse() {
            assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
            assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
            assert_eq!(LogFormat::default().to_string(), "standard");
            assert!("xml".parse::<LogFormat>().is_err());
        }
    }
}
