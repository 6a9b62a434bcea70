//! Create a database in host memory, query it, and snapshot it.
//!
//! Run with: `cargo run --example memory_db`

use sqlbox::{Connection, Instance, MemoryVfs, SqliteModule, Value};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Path to the engine build
    let wasm_path =
        std::env::var("SQLBOX_SQLITE_WASM").unwrap_or_else(|_| "sqlite3.wasm".to_string());

    println!("Loading SQLite engine from: {wasm_path}");
    let module = SqliteModule::from_file(&wasm_path)?;

    // Keep a handle on the storage so the host can look at the files later
    let storage = MemoryVfs::new();
    let instance = Instance::builder()
        .with_vfs("host-memory", storage.clone())
        .build(&module)?;
    println!("SQLite version: {}", instance.libversion()?);
    println!();

    let db = Connection::open(&instance, "notes.db")?;

    println!("=== Example 1: Schema and rows ===");
    db.execute(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, score REAL);
         INSERT INTO notes (body, score) VALUES ('first', 1.5), ('second', 2.0);",
    )?;
    for row in db.execute("SELECT id, body, score FROM notes ORDER BY id")? {
        let rendered: Vec<String> = row
            .iter()
            .map(|entry| format!("{}={}", entry.name, entry.value.as_deref().unwrap_or("NULL")))
            .collect();
        println!("  {}", rendered.join(", "));
    }
    println!();

    println!("=== Example 2: Prepared statement with bindings ===");
    if let Some(mut stmt) = db.prepare("INSERT INTO notes (body, score) VALUES (?, ?)")? {
        for (body, score) in [("third", 3.25), ("fourth", 4.0)] {
            stmt.bind(&[Value::from(body), Value::from(score)])?;
            stmt.step()?;
            stmt.reset()?;
        }
        stmt.finalize()?;
    }
    println!("Last rowid: {}", db.last_insert_rowid()?);
    println!();

    println!("=== Example 3: Typed columns ===");
    if let Some(mut stmt) = db.prepare("SELECT body, score FROM notes WHERE score > ?")? {
        stmt.bind_double(1, 2.0)?;
        println!("Columns: {:?}", stmt.column_names()?);
        while stmt.step()? {
            println!("  {:?}", stmt.columns(false)?);
        }
        stmt.finalize()?;
    }
    println!();

    println!("=== Example 4: Snapshot ===");
    if let Some(image) = db.serialize("main", 0)? {
        println!("Snapshot is {} bytes", image.len());
        let copy = Connection::from_serialized(&instance, &image)?;
        let rows = copy.execute("SELECT count(*) AS n FROM notes")?;
        println!("Rows in copy: {:?}", rows.first().and_then(|r| r[0].value.clone()));
        copy.close()?;
    }
    println!();

    db.close()?;
    println!("Files in host memory: {:?}", storage.file_names());

    Ok(())
}
