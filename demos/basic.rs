use serde_json::json;
use synced_json::Registry;

fn main() -> Result<(), synced_json::Error> {
    let path = std::env::temp_dir().join("synced_json_demo_basic.json");
    let registry = Registry::new();
    let doc = registry.open_dict(&path)?;

    // set / get / remove; every call rewrites the file
    doc.set("apples", 3)?;
    doc.set("bananas", 5)?;
    println!("apples  = {:?}", doc.get_value("apples")?);
    println!("bananas = {:?}", doc.get_value("bananas")?);

    // read-modify-write under the file lock
    doc.modify("apples", |n| n.and_then(|v| v.as_i64()).unwrap_or(0) + 1)?;
    println!("apples after modify = {:?}", doc.get_as::<i64>("apples")?);

    let oranges = doc.set_default("oranges", 0)?;
    println!("oranges (default 0) = {oranges}");

    // nested containers come back as live handles
    doc.set("basket", json!({"owner": "sam", "items": []}))?;
    let items = doc.dict("basket")?.list("items")?;
    items.push("pear")?;
    items.extend(["plum", "fig"])?;
    println!("basket items at {} = {:?}", items.location(), items.iter()?);

    println!("keys   = {:?}", doc.keys()?);
    println!("len    = {}", doc.len()?);
    println!("on disk: {}", std::fs::read_to_string(&path).unwrap_or_default());

    doc.clear()?;
    println!("after clear: len = {}", doc.len()?);

    let _ = std::fs::remove_file(&path);
    Ok(())
}
