use std::time::Duration;

use colored::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::config::OriginPolicy;
use crate::error::RelayError;
use crate::relay::{self, RelayState};

/// Path the chat socket is served on.
pub const SOCKET_PATH: &str = "/socket";

pub const HEALTH_BODY: &str = "Server is healthy and running.";

/// Largest request head we look at before giving up.
const MAX_HEAD: usize = 8192;

/// Embedded single-page chat client.
pub const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Chat Relay</title>
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{background:#0d1117;color:#c9d1d9;font-family:'Cascadia Code','Fira Code',monospace;height:100vh;display:flex;flex-direction:column}
header{padding:12px 20px;border-bottom:1px solid #21262d;display:flex;align-items:center;gap:12px;flex-wrap:wrap}
header h1{font-size:1.1rem;color:#58a6ff;flex:1}
#status{font-size:.75rem;padding:2px 8px;border-radius:10px;background:#da3633;color:#fff}
#status.on{background:#238636}
.field{display:flex;gap:6px;align-items:center;font-size:.75rem;color:#8b949e}
input[type=text]{background:#0d1117;border:1px solid #30363d;color:#c9d1d9;padding:6px 10px;border-radius:6px;font-family:inherit;font-size:.85rem}
input[type=text]:focus{outline:none;border-color:#58a6ff}
.btn{border:none;padding:6px 12px;border-radius:6px;font-family:inherit;font-size:.8rem;cursor:pointer;color:#fff;background:#30363d}
.btn:disabled{background:#21262d;color:#484f58;cursor:not-allowed}
.btn-go{background:#238636}
.btn-call.on{background:#f85149}
#msgs{flex:1;overflow-y:auto;padding:16px 20px;display:flex;flex-direction:column;gap:8px}
.msg{max-width:70%;padding:8px 12px;border-radius:8px;background:#161b22;border:1px solid #21262d;line-height:1.45;word-wrap:break-word}
.msg.own{align-self:flex-end;background:#0b2a4a;border-color:#1f6feb}
.msg.ai{border-color:#a371f7}
.msg .meta{font-size:.68rem;color:#8b949e;margin-bottom:3px}
.msg img{max-width:240px;border-radius:6px;margin-top:6px;display:block}
.note{align-self:center;font-size:.72rem;color:#8b949e}
footer{padding:10px 20px;border-top:1px solid #21262d;display:flex;gap:8px;align-items:center}
#text{flex:1}
#preview{font-size:.7rem;color:#e3b341}
</style>
</head>
<body>
<header>
  <h1>Chat Relay</h1>
  <span id="status">offline</span>
  <div class="field">name <input type="text" id="author" placeholder="Anonymous" size="10"></div>
  <div class="field">room <input type="text" id="room" placeholder="(private)" size="10"><button class="btn" id="join">Join</button></div>
  <button class="btn btn-call" id="call" title="Voice call with the AI">Call</button>
</header>
<div id="msgs"></div>
<footer>
  <input type="file" id="file" accept="image/*" hidden>
  <button class="btn" id="attach" title="Attach an image">Image</button>
  <span id="preview"></span>
  <input type="text" id="text" placeholder="Type a message..." autocomplete="off">
  <button class="btn btn-go" id="send">Send</button>
</footer>
<script>
const $=id=>document.getElementById(id);
let ws=null,connected=false,policy='room-excluding-sender',aiAuthor=null,room='',image=null;
// call mode
const SR=window.SpeechRecognition||window.webkitSpeechRecognition,synth=window.speechSynthesis;
let epoch=0,vstate='idle',awaiting=false,rec=null;

function setStatus(on){connected=on;$('status').textContent=on?'online':'offline';$('status').classList.toggle('on',on);$('send').disabled=!on}
function echoes(){return !room||policy!=='room-excluding-sender'}
function note(t){const d=document.createElement('div');d.className='note';d.textContent=t;$('msgs').appendChild(d)}
function add(m,own){
  const d=document.createElement('div');
  d.className='msg'+(own||m.author==='You'?' own':'')+(m.author===aiAuthor?' ai':'');
  const meta=document.createElement('div');meta.className='meta';
  meta.textContent=m.author+' · '+(m.time||'').slice(11,16)+(m.room?' · #'+m.room:'');
  d.appendChild(meta);
  const body=document.createElement('div');body.textContent=m.message;d.appendChild(body);
  if(m.image){const i=document.createElement('img');i.src=m.image.startsWith('data:')?m.image:'data:image/jpeg;base64,'+m.image;d.appendChild(i)}
  $('msgs').appendChild(d);$('msgs').scrollTop=$('msgs').scrollHeight;
}
function emit(event,data){if(ws&&connected)ws.send(JSON.stringify({event,data}))}
function sendText(text,img){
  text=(text||'').trim();
  if(!connected||(!text&&!img))return;
  const author=$('author').value.trim();
  const data={message:text};
  if(img)data.image=img;
  if(author)data.author=author;
  if(room)data.room=room;
  emit('send_message',data);
  if(!echoes())add({author:'You',message:text,image:img,room:room||null,time:new Date().toISOString()},true);
}
function connect(){
  ws=new WebSocket((location.protocol==='https:'?'wss://':'ws://')+location.host+'/socket');
  ws.onopen=()=>{setStatus(true);if(room)emit('join_room',room)};
  ws.onclose=()=>{setStatus(false);exitCall();setTimeout(connect,2000)};
  ws.onmessage=e=>{
    let f;try{f=JSON.parse(e.data)}catch(_){return}
    if(f.event==='welcome'){policy=f.data.broadcast_policy;aiAuthor=f.data.ai_author||null}
    else if(f.event==='receive_message'){add(f.data);if(vstate!=='idle'&&f.data.author===aiAuthor)speak(f.data.message)}
    else if(f.event==='error'){note(f.data.message)}
  };
}

function listen(ep){
  if(ep!==epoch||vstate!=='listening')return;
  const r=new SR();rec=r;r.lang='en-US';r.interimResults=false;
  let failed=false;
  r.onresult=ev=>{if(ep!==epoch)return;const t=ev.results[0][0].transcript.trim();if(t){awaiting=true;sendText(t,null)}};
  r.onerror=ev=>{if(ep!==epoch||ev.error==='no-speech')return;failed=true;setTimeout(()=>listen(ep),1000)};
  r.onend=()=>{if(ep!==epoch||vstate!=='listening'||awaiting||failed)return;listen(ep)};
  try{r.start()}catch(_){}
}
function speak(text){
  const ep=epoch;vstate='speaking';awaiting=false;callUI();
  if(rec){try{rec.abort()}catch(_){}}
  const u=new SpeechSynthesisUtterance(text);
  u.onend=u.onerror=()=>{if(ep!==epoch)return;vstate='listening';callUI();listen(ep)};
  synth.speak(u);
}
function enterCall(){
  if(!SR||!synth){note('Voice calls are not supported in this browser.');return}
  epoch++;vstate='listening';awaiting=false;callUI();listen(epoch);
}
function exitCall(){
  if(vstate==='idle')return;
  epoch++;vstate='idle';awaiting=false;
  if(rec){try{rec.abort()}catch(_){}}
  synth&&synth.cancel();callUI();
}
function callUI(){$('call').classList.toggle('on',vstate!=='idle');$('call').textContent=vstate==='idle'?'Call':'End call';$('call').disabled=vstate==='speaking'}

$('send').onclick=()=>{sendText($('text').value,image);$('text').value='';image=null;$('preview').textContent=''};
$('text').onkeydown=e=>{if(e.key==='Enter')$('send').click()};
$('join').onclick=()=>{room=$('room').value.trim();if(room){emit('join_room',room);note('joined #'+room)}};
$('attach').onclick=()=>$('file').click();
$('file').onchange=()=>{const f=$('file').files[0];if(!f)return;const rd=new FileReader();rd.onload=()=>{image=rd.result;$('preview').textContent=f.name};rd.readAsDataURL(f);$('file').value=''};
$('call').onclick=()=>{vstate==='idle'?enterCall():exitCall()};
setStatus(false);connect();
</script>
</body>
</html>
"##;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bind the configured address and serve until the process exits.
pub async fn serve(state: RelayState) -> Result<(), RelayError> {
    let listener = TcpListener::bind(state.settings.bind_addr()).await?;
    let addr = listener.local_addr()?;

    eprintln!("{}", format!("  Chat relay listening on http://{}", addr).bright_green());
    eprintln!("{}", format!("  Socket endpoint: ws://{}{}", addr, SOCKET_PATH).bright_blue());
    if let Some(ai) = state.settings.ai_author() {
        eprintln!("{}", format!("  AI participant: {} ({})", ai, state.settings.ai.model).bright_cyan());
    }
    tracing::info!(%addr, policy = %state.settings.broadcast_policy, ai = state.ai_enabled(), "server started");

    run(listener, state).await
}

/// Accept loop over an already bound listener.
pub async fn run(listener: TcpListener, state: RelayState) -> Result<(), RelayError> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                tracing::debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: RelayState) -> Result<(), RelayError> {
    let head = match peek_head(&stream).await? {
        Some(head) => head,
        None => {
            stream.write_all(bad_request().as_bytes()).await?;
            return Ok(());
        }
    };

    if head.upgrade_websocket {
        if head.path != SOCKET_PATH {
            stream.write_all(not_found().as_bytes()).await?;
            return Ok(());
        }
        let origins = state.settings.allowed_origins.clone();
        let check_origin = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
            let origin = header("origin");
            if origins.allows_request(origin, header("host")) {
                Ok(resp)
            } else {
                tracing::warn!(origin = origin.unwrap_or("-"), "socket blocked by origin policy");
                let mut err = ErrorResponse::new(Some("Origin not allowed".to_string()));
                *err.status_mut() = StatusCode::FORBIDDEN;
                Err(err)
            }
        };
        match tokio_tungstenite::accept_hdr_async(stream, check_origin).await {
            Ok(ws) => relay::handle_socket(ws, state).await,
            Err(e) => tracing::debug!(error = %e, "websocket handshake failed"),
        }
        return Ok(());
    }

    // Drain the request we peeked at before answering.
    let mut buf = vec![0u8; MAX_HEAD];
    let _ = stream.read(&mut buf).await?;
    let response = route(&head, &state.settings.allowed_origins);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Peek until a full request head is buffered. `None` for garbage.
async fn peek_head(stream: &TcpStream) -> Result<Option<RequestHead>, RelayError> {
    let mut buf = vec![0u8; MAX_HEAD];
    for _ in 0..50 {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        match parse_request_head(&buf[..n]) {
            HeadParse::Complete(head) => return Ok(Some(head)),
            HeadParse::Invalid => return Ok(None),
            HeadParse::Partial if n == buf.len() => return Ok(None),
            HeadParse::Partial => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub origin: Option<String>,
    pub host: Option<String>,
    pub upgrade_websocket: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadParse {
    Complete(RequestHead),
    Partial,
    Invalid,
}

pub fn parse_request_head(bytes: &[u8]) -> HeadParse {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return HeadParse::Partial,
        Err(_) => return HeadParse::Invalid,
    }

    let header = |name: &str| {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
    };
    let target = req.path.unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/").to_string();

    HeadParse::Complete(RequestHead {
        method: req.method.unwrap_or("GET").to_string(),
        path,
        origin: header("origin").map(str::to_string),
        host: header("host").map(str::to_string),
        upgrade_websocket: header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")),
    })
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Build the raw HTTP response for a non-upgrade request.
pub fn route(head: &RequestHead, origins: &OriginPolicy) -> String {
    let origin = head.origin.as_deref();
    if !origins.allows_request(origin, head.host.as_deref()) {
        tracing::warn!(origin = origin.unwrap_or("-"), path = %head.path, "http request blocked by origin policy");
        return http_response("403 Forbidden", "text/plain; charset=utf-8", &[], "Not allowed by CORS");
    }
    let cors = cors_headers(origin);

    match (head.method.as_str(), head.path.as_str()) {
        ("OPTIONS", _) => {
            let mut headers = cors;
            headers.push(("Access-Control-Allow-Methods", "GET, POST, OPTIONS".to_string()));
            headers.push(("Access-Control-Allow-Headers", "Content-Type".to_string()));
            http_response("204 No Content", "text/plain", &headers, "")
        }
        ("GET", "/health") => http_response("200 OK", "text/plain; charset=utf-8", &cors, HEALTH_BODY),
        ("GET", "/") | ("GET", "/index.html") => {
            http_response("200 OK", "text/html; charset=utf-8", &cors, INDEX_HTML)
        }
        _ => not_found(),
    }
}

fn cors_headers(origin: Option<&str>) -> Vec<(&'static str, String)> {
    match origin {
        Some(origin) => vec![
            ("Access-Control-Allow-Origin", origin.to_string()),
            ("Access-Control-Allow-Credentials", "true".to_string()),
            ("Vary", "Origin".to_string()),
        ],
        None => Vec::new(),
    }
}

fn http_response(
    status: &str,
    content_type: &str,
    headers: &[(&'static str, String)],
    body: &str,
) -> String {
    let mut out = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        content_type,
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

fn not_found() -> String {
    http_response("404 Not Found", "text/plain", &[], "Not Found")
}

fn bad_request() -> String {
    http_response("400 Bad Request", "text/plain", &[], "Bad Request")
}
