//! Declarative tasks against a local Ollama server.
//!
//! This example demonstrates:
//! - Declaring a task from an instruction block and a typed signature
//! - Calling it and reading the answer back as a Rust value
//! - Composing deferred calls into a single chain-of-thought request
//! - Streaming a chat reply chunk by chunk
//!
//! Run with `cargo run --example extract_phone_numbers --features llm` while Ollama serves
//! the `phi4` model on localhost.

use promptwright::prelude::*;
use promptwright::llm::OllamaBackend;
use std::io::Write;
use std::sync::Arc;

fn main() -> Result<(), TaskError> {
    let runtime = TaskRuntime::new(
        Arc::new(OllamaBackend::new()),
        RuntimeConfig::new().model("phi4"),
    )
    .with_hook(Arc::new(LoggingHook));

    // ============================================================================
    // Step 1: A single structured task
    // ============================================================================

    let extract = Task::builder()
        .name("extract_phone_numbers")
        .instructions(
            "Extract the phone numbers from the provided text\n\
             :param text: the text to scan\n\
             :return: the phone numbers, exactly as written",
        )
        .signature(signature!("text: string -> List[string]"))
        .build();

    let mut args = Args::new();
    args.insert(
        "text".into(),
        "Reach the office at 555-1234 or my cell at 555-9876.".into(),
    );
    let numbers: Vec<String> = runtime.call_as(&extract, args)?;
    println!("Phone numbers: {:?}", numbers);

    // ============================================================================
    // Step 2: A chain of dependent tasks in one request
    // ============================================================================

    let name = Task::builder()
        .name("name_product")
        .instructions("Invent a product name about {theme}\n:return product: the name")
        .signature(signature!("theme: str -> str"))
        .build();
    let slogan = Task::builder()
        .name("write_slogan")
        .instructions("Write a short slogan for {product}\n:return slogan: the slogan")
        .signature(signature!("product: str -> str"))
        .build();

    let product = name.plan([("theme", Arg::from("coffee"))])?;
    let tagline = slogan.plan([("product", Arg::from(&product))])?;
    let results = runtime.run_chain(&tagline)?;
    println!("Chain results: {}", results);

    // ============================================================================
    // Step 3: A streamed chat reply
    // ============================================================================

    let chat = Chat::builder(runtime)
        .name("barista")
        .system("You are a cheerful barista at a {style} coffee shop.")
        .arg("style", "tiny")
        .greeting("Hi! What can I get you?")
        .build()?;

    let mut stream = chat.send_streaming("Something without milk, please.")?;
    for chunk in stream.by_ref() {
        print!("{}", chunk?.delta);
        let _ = std::io::stdout().flush();
    }
    println!();
    println!("History holds {} messages", chat.history().list()?.len());

    Ok(())
}
