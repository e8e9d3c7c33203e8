use std::process::ExitCode;

fn main() -> ExitCode {
    wardflow_cli::run()
}
