//! Interface de linha de comando do remediator baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (classify, run, demo)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Orquestrador de remediação de violações de conformidade.
#[derive(Debug, Parser)]
#[command(name = "remediator", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML (padrão: $REMEDIATOR_CONFIG ou ./remediator.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Classifica violações sem criar workflows.
    Classify {
        /// Arquivo JSON ou TOML com as violações.
        file: PathBuf,
    },

    /// Processa um lote de violações até cada workflow se estabilizar.
    Run {
        /// Arquivo JSON ou TOML com as violações.
        file: PathBuf,

        /// Máximo de violações processadas ao mesmo tempo.
        #[arg(long, default_value_t = 5)]
        max_concurrent: usize,

        /// Imprime o relatório em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Executa a demonstração embutida com violações de exemplo.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["remediator", "run", "violations.json", "--max-concurrent", "2"]);
        match cli.command {
            Command::Run {
                file,
                max_concurrent,
                json,
            } => {
                assert_eq!(file, PathBuf::from("violations.json"));
                assert_eq!(max_concurrent, 2);
                assert!(!json);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["remediator", "--config", "ops.toml", "--verbose", "demo"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("ops.toml")));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn run_defaults_to_five_concurrent() {
        let cli = Cli::parse_from(["remediator", "run", "batch.toml"]);
        assert!(matches!(cli.command, Command::Run { max_concurrent: 5, .. }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
