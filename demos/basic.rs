//! Talks to a running master at `127.0.0.1:12345`, does a put/get/delete
//! round trip, then lists the cluster's nodes. Point `loopcached server` at a
//! master config before running this.

use loopcache::Client;

#[tokio::main]
async fn main() {
    let client = Client::connect("127.0.0.1", 12345)
        .await
        .expect("failed to connect to master");

    match client.put("foo", b"fo might do popeyes ovalue").await {
        Ok(()) => println!("set 'foo' successfully"),
        Err(err) => println!("got error during 'foo' put: {:?}", err),
    }

    match client.get("foo").await {
        Ok(Some(value)) => println!("got value for 'foo': {:?}", value),
        Ok(None) => println!("'foo' is missing"),
        Err(err) => println!("got error during 'foo' get: {:?}", err),
    }

    match client.delete("foo").await {
        Ok(()) => println!("deleted 'foo' successfully"),
        Err(err) => println!("got error during 'foo' delete: {:?}", err),
    }

    println!("cluster nodes:");
    for node in client.nodes() {
        println!(
            "  {}\tmaxBytes={}\tstatus={}",
            node.canonical_name(),
            node.max_bytes,
            node.status
        );
    }
}
