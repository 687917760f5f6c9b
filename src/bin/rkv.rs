/*
 * rkv is the replikv console client. It connects to a cluster node, sends
 * each input line as a command, and prints responses as they arrive.
 */

#![warn(clippy::all)]

use replikv::error::Result;
use replikv::Client;
use rustyline::error::ReadlineError;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A console client for a replikv node")
        .arg(clap::Arg::new("addr").default_value("127.0.0.1:9001").help("host:port of a cluster node"))
        .get_matches();
    let addr = args.get_one::<String>("addr").unwrap();

    let mut client = Client::connect(addr)?;
    println!("Connected to replikv node at {addr}. Commands: SET key value, GET key, DEL key, KEYS, EXIT");

    // Responses can span multiple lines (KEYS), so a separate thread prints
    // whatever the server sends.
    let mut responses = client.try_clone()?;
    std::thread::spawn(move || loop {
        match responses.recv_line() {
            Ok(line) => println!("{line}"),
            Err(_) => {
                println!("Connection closed by server");
                std::process::exit(0);
            }
        }
    });

    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        match editor.readline("replikv> ") {
            Ok(input) if input.trim() == "EXIT" => break,
            Ok(input) => {
                if input.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&input);
                client.send(&input)?;
                // Let the response print before the next prompt is drawn.
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
