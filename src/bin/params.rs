use ledmap::config::CalibrationConfig;
use serde_json::json;

fn main() {
    let params = CalibrationConfig::default();
    let json = json!(params);
    println!("{}", serde_json::to_string_pretty(&json).unwrap());
}
