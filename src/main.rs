use std::process::ExitCode;

fn main() -> ExitCode {
    osc_wardrobe_lib::run()
}
