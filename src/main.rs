use std::process::ExitCode;

fn main() -> ExitCode {
    match pastecall::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pastecall: {e}");
            ExitCode::FAILURE
        }
    }
}
