use rawimg_layout::ImageDescription;
use schemars::schema_for;
use serde as _;

fn main() {
    let schema = schema_for!(ImageDescription);
    println!("{}", serde_json::to_string_pretty(&schema).unwrap());
}
