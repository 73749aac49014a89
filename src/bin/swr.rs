use std::env;
use std::ffi::OsString;
use std::process::{Command, exit};

fn main() {
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    match Command::new("stackwright").args(&args).status() {
        Ok(status) => match status.code() {
            Some(0) => {}
            Some(code) => exit(code),
            None => exit(1),
        },
        Err(err) => {
            eprintln!("Failed to invoke stackwright: {err}");
            exit(1);
        }
    }
}
