use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use quorumtally::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

mod rest;

#[derive(PartialEq, PartialOrd, Copy, Clone)]
enum Verbosity {
    Warn,
    Info,
}

fn main() {
    let election_arg = Arg::with_name("ELECTION-ID")
        .index(1)
        .required(true)
        .help("Election id");
    let input_arg = Arg::with_name("INPUT")
        .index(2)
        .required(true)
        .help("Request file in JSON format");

    let matches = App::new("QuorumTally CLI")
        .version("1.0")
        .author("Patrick Hayes <patrick.d.hayes@gmail.com>")
        .about("Drives threshold decryption on a quorumtally daemon")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("uri")
                .help("Set the quorumtally uri - can also be set with QUORUMTALLY_URI")
                .required(false),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("progress")
                .about("Show decryption progress")
                .arg(election_arg.clone()),
        )
        .subcommand(
            SubCommand::with_name("submit")
                .about("Submit a guardian's partial decryption")
                .arg(election_arg.clone())
                .arg(input_arg.clone().help(
                    "Submission in JSON format, or with --compute the guardian's private material",
                ))
                .arg(
                    Arg::with_name("compute")
                        .long("compute")
                        .help("Have the engine compute the share from private material"),
                ),
        )
        .subcommand(
            SubCommand::with_name("compensate")
                .about("Compensate for a missing guardian")
                .arg(election_arg.clone())
                .arg(input_arg),
        )
        .subcommand(
            SubCommand::with_name("combine")
                .about("Combine shares and decrypt the tally")
                .arg(election_arg.clone()),
        )
        .subcommand(
            SubCommand::with_name("result")
                .about("Show the decrypted result")
                .arg(election_arg),
        )
        .get_matches();

    let verbosity = match matches.occurrences_of("v") {
        0 => Verbosity::Warn,
        _ => Verbosity::Info,
    };

    let env_var = std::env::var("QUORUMTALLY_URI");
    let uri = match matches.value_of("uri") {
        Some(uri) => uri,
        None => env_var.as_deref().unwrap_or("http://localhost:8000"),
    };
    if verbosity >= Verbosity::Info {
        eprintln!("URI: {}", uri);
    }

    match matches.subcommand() {
        ("progress", Some(matches)) => command_progress(matches, uri),
        ("submit", Some(matches)) => command_submit(matches, uri),
        ("compensate", Some(matches)) => command_compensate(matches, uri),
        ("combine", Some(matches)) => command_combine(matches, uri),
        ("result", Some(matches)) => command_result(matches, uri),
        _ => {}
    }
}

fn command_progress(matches: &ArgMatches, uri: &str) {
    let id = election_id("progress", matches);
    let progress: DecryptionProgress = rest::get(uri, &decryption_path(id, "progress"))
        .unwrap_or_else(|e| fail("progress", e));
    print(&progress);
}

fn command_submit(matches: &ArgMatches, uri: &str) {
    let id = election_id("submit", matches);
    let receipt: SubmissionReceipt = if matches.is_present("compute") {
        let computation: PartialDecryptionComputation = read_input("submit", matches);
        rest::post(uri, &decryption_path(id, "partial/compute"), Some(&computation))
    } else {
        let submission: PartialDecryptionSubmission = read_input("submit", matches);
        rest::post(uri, &decryption_path(id, "partial"), Some(&submission))
    }
    .unwrap_or_else(|e| fail("submit", e));
    print(&receipt);
}

fn command_compensate(matches: &ArgMatches, uri: &str) {
    let id = election_id("compensate", matches);
    let request: CompensationRequest = read_input("compensate", matches);
    let record: CompensatedDecryptionShare =
        rest::post(uri, &decryption_path(id, "compensation"), Some(&request))
            .unwrap_or_else(|e| fail("compensate", e));
    print(&record);
}

fn command_combine(matches: &ArgMatches, uri: &str) {
    let id = election_id("combine", matches);
    let result: DecryptionResult = rest::post::<(), _>(uri, &decryption_path(id, "combine"), None)
        .unwrap_or_else(|e| fail("combine", e));
    print(&result);
}

fn command_result(matches: &ArgMatches, uri: &str) {
    let id = election_id("result", matches);
    let result: DecryptionResult =
        rest::get(uri, &decryption_path(id, "result")).unwrap_or_else(|e| fail("result", e));
    print(&result);
}

fn decryption_path(id: Uuid, action: &str) -> String {
    format!("/api/election/{}/decryption/{}", id, action)
}

fn election_id(command: &str, matches: &ArgMatches) -> Uuid {
    let id = match matches.value_of("ELECTION-ID") {
        Some(id) => id,
        None => fail(command, "election id required"),
    };
    id.parse()
        .unwrap_or_else(|e| fail(command, format!("invalid election id {}: {}", id, e)))
}

fn read_input<T: DeserializeOwned>(command: &str, matches: &ArgMatches) -> T {
    let filename = match matches.value_of("INPUT") {
        Some(filename) => expand(filename),
        None => fail(command, "input filename required"),
    };

    let file_bytes = match std::fs::read(&filename) {
        Ok(bytes) => bytes,
        Err(e) => fail(command, format!("unable to read {}: {}", filename, e)),
    };

    serde_json::from_slice(&file_bytes)
        .unwrap_or_else(|e| fail(command, format!("unable to parse {}: {}", filename, e)))
}

/// Expand `~` and environment variables in a path, leaving it as-is if that fails
fn expand(filename: &str) -> String {
    match shellexpand::full(filename) {
        Ok(expanded) => expanded.into_owned(),
        Err(_) => filename.to_owned(),
    }
}

fn print<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail("output", e),
    }
}

fn fail<E: std::fmt::Display>(command: &str, e: E) -> ! {
    eprintln!("quorumtally {}: {}", command, e);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_paths() {
        std::env::set_var("QUORUMTALLY_TEST_DIR", "/tmp/qt");
        assert_eq!(expand("$QUORUMTALLY_TEST_DIR/share.json"), "/tmp/qt/share.json");
        assert_eq!(expand("plain.json"), "plain.json");

        // Unset variables are left alone
        assert_eq!(
            expand("$QUORUMTALLY_SURELY_UNSET/x.json"),
            "$QUORUMTALLY_SURELY_UNSET/x.json"
        );
    }

    #[test]
    fn paths() {
        let id = Uuid::nil();
        assert_eq!(
            decryption_path(id, "partial/compute"),
            "/api/election/00000000-0000-0000-0000-000000000000/decryption/partial/compute"
        );
    }
}
