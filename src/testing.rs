//! Helpers shared by the unit tests

/// Serve `app` on an ephemeral local port, returning its base url
pub async fn serve<State: Clone + Send + Sync + 'static>(app: tide::Server<State>) -> String {
    let listener = async_std::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("test listener addr");
    async_std::task::spawn(async move {
        app.listen(listener).await.ok();
    });
    format!("http://{}", addr)
}
