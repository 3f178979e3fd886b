//! Human-readable rendering of daemon replies.

use crate::proto::Reply;

/// Print a reply; the return value is the process exit code.
pub fn render(reply: &Reply) -> i32 {
    if let Some(error) = &reply.error {
        eprintln!("error: {error}");
        return 1;
    }

    if let Some(state) = &reply.state {
        match &reply.reason {
            Some(reason) => println!("state: {state} ({reason})"),
            None => println!("state: {state}"),
        }
    }
    if let Some(location) = &reply.location {
        println!(
            "at {}:{} in {}",
            location.file, location.line, location.function
        );
    }
    if let Some(exit_code) = reply.exit_code {
        println!("exit code: {exit_code}");
    }
    if let Some(breakpoints) = &reply.breakpoints {
        for bp in breakpoints {
            let status = if bp.verified { "set" } else { "unverified" };
            println!("breakpoint {}:{} {status}", bp.file, bp.line);
        }
    }
    if let Some(variables) = &reply.variables {
        if variables.is_empty() {
            println!("no local variables");
        }
        for var in variables {
            match &var.r#type {
                Some(ty) => println!("{} = {}  ({ty})", var.name, var.value),
                None => println!("{} = {}", var.name, var.value),
            }
        }
    }
    if let Some(frames) = &reply.frames {
        for (idx, frame) in frames.iter().enumerate() {
            match (&frame.file, frame.line) {
                (Some(file), Some(line)) => {
                    println!("#{idx} {} ({file}:{line})", frame.name)
                }
                _ => println!("#{idx} {}", frame.name),
            }
        }
    }
    if let Some(result) = &reply.result {
        match &reply.r#type {
            Some(ty) => println!("{result}  ({ty})"),
            None => println!("{result}"),
        }
    }
    if let Some(source) = &reply.source {
        println!("{source}");
    }
    if let Some(message) = &reply.message {
        println!("{message}");
    }
    0
}
